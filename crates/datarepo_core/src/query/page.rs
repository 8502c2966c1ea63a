//! Sorting and paging inputs, and the page/slice result shapes.
//!
//! # Invariants
//! - Page indexes are zero-based.
//! - A page request never has a zero size.
//! - `Slice` knows whether a next page exists without counting rows.

use crate::model::entity::Attr;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Asc,
    Desc,
}

/// One sort key. `property` is an attribute name of the queried entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Order {
    pub property: String,
    pub direction: Direction,
}

/// Ordered list of sort keys; empty means unsorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Sort {
    orders: Vec<Order>,
}

impl Sort {
    pub fn unsorted() -> Self {
        Self::default()
    }

    pub fn asc<E>(attr: Attr<E>) -> Self {
        Self::by(attr.name(), Direction::Asc)
    }

    pub fn desc<E>(attr: Attr<E>) -> Self {
        Self::by(attr.name(), Direction::Desc)
    }

    /// Sort by attribute name, checked against the entity at execution.
    pub fn by(property: impl Into<String>, direction: Direction) -> Self {
        Self {
            orders: vec![Order {
                property: property.into(),
                direction,
            }],
        }
    }

    /// Appends `other`'s keys after this sort's keys.
    pub fn and(mut self, other: Sort) -> Self {
        self.orders.extend(other.orders);
        self
    }

    pub fn orders(&self) -> &[Order] {
        &self.orders
    }

    pub fn is_unsorted(&self) -> bool {
        self.orders.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageRequestError {
    ZeroSize,
}

impl Display for PageRequestError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ZeroSize => write!(f, "page size must be at least 1"),
        }
    }
}

impl Error for PageRequestError {}

/// Zero-indexed page number, page size and sort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageRequest {
    page: u32,
    size: u32,
    sort: Sort,
}

impl PageRequest {
    pub fn of(page: u32, size: u32) -> Result<Self, PageRequestError> {
        if size == 0 {
            return Err(PageRequestError::ZeroSize);
        }
        Ok(Self {
            page,
            size,
            sort: Sort::unsorted(),
        })
    }

    pub fn with_sort(mut self, sort: Sort) -> Self {
        self.sort = sort;
        self
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn sort(&self) -> &Sort {
        &self.sort
    }

    /// Rows skipped before this page.
    pub fn offset(&self) -> u64 {
        u64::from(self.page) * u64::from(self.size)
    }

    pub fn next(&self) -> Self {
        Self {
            page: self.page.saturating_add(1),
            ..self.clone()
        }
    }

    pub fn previous_or_first(&self) -> Self {
        Self {
            page: self.page.saturating_sub(1),
            ..self.clone()
        }
    }

    pub fn first(&self) -> Self {
        Self {
            page: 0,
            ..self.clone()
        }
    }
}

/// One page of results plus the total row count of the query.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    content: Vec<T>,
    request: PageRequest,
    total_elements: u64,
}

impl<T> Page<T> {
    pub fn new(content: Vec<T>, request: PageRequest, total_elements: u64) -> Self {
        Self {
            content,
            request,
            total_elements,
        }
    }

    pub fn content(&self) -> &[T] {
        &self.content
    }

    pub fn into_content(self) -> Vec<T> {
        self.content
    }

    pub fn request(&self) -> &PageRequest {
        &self.request
    }

    pub fn number(&self) -> u32 {
        self.request.page
    }

    pub fn size(&self) -> u32 {
        self.request.size
    }

    pub fn number_of_elements(&self) -> usize {
        self.content.len()
    }

    pub fn total_elements(&self) -> u64 {
        self.total_elements
    }

    pub fn total_pages(&self) -> u64 {
        self.total_elements.div_ceil(u64::from(self.request.size))
    }

    pub fn is_first(&self) -> bool {
        !self.has_previous()
    }

    pub fn is_last(&self) -> bool {
        !self.has_next()
    }

    pub fn has_next(&self) -> bool {
        u64::from(self.request.page) + 1 < self.total_pages()
    }

    pub fn has_previous(&self) -> bool {
        self.request.page > 0
    }

    /// Transforms the content, keeping paging metadata.
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            content: self.content.into_iter().map(f).collect(),
            request: self.request,
            total_elements: self.total_elements,
        }
    }
}

impl<T: Serialize> Serialize for Page<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Page", 8)?;
        state.serialize_field("content", &self.content)?;
        state.serialize_field("number", &self.number())?;
        state.serialize_field("size", &self.size())?;
        state.serialize_field("sort", &self.request.sort)?;
        state.serialize_field("total_elements", &self.total_elements)?;
        state.serialize_field("total_pages", &self.total_pages())?;
        state.serialize_field("first", &self.is_first())?;
        state.serialize_field("last", &self.is_last())?;
        state.end()
    }
}

/// One page of results that only knows whether another page follows.
#[derive(Debug, Clone, PartialEq)]
pub struct Slice<T> {
    content: Vec<T>,
    request: PageRequest,
    has_next: bool,
}

impl<T> Slice<T> {
    /// Builds a slice from a `size + 1` row lookahead fetch.
    pub fn from_lookahead(mut rows: Vec<T>, request: PageRequest) -> Self {
        let size = usize::try_from(request.size).unwrap_or(usize::MAX);
        let has_next = rows.len() > size;
        rows.truncate(size);
        Self {
            content: rows,
            request,
            has_next,
        }
    }

    pub fn content(&self) -> &[T] {
        &self.content
    }

    pub fn into_content(self) -> Vec<T> {
        self.content
    }

    pub fn request(&self) -> &PageRequest {
        &self.request
    }

    pub fn number(&self) -> u32 {
        self.request.page
    }

    pub fn size(&self) -> u32 {
        self.request.size
    }

    pub fn is_first(&self) -> bool {
        !self.has_previous()
    }

    pub fn is_last(&self) -> bool {
        !self.has_next
    }

    pub fn has_next(&self) -> bool {
        self.has_next
    }

    pub fn has_previous(&self) -> bool {
        self.request.page > 0
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Slice<U> {
        Slice {
            content: self.content.into_iter().map(f).collect(),
            request: self.request,
            has_next: self.has_next,
        }
    }
}

impl<T: Serialize> Serialize for Slice<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Slice", 6)?;
        state.serialize_field("content", &self.content)?;
        state.serialize_field("number", &self.number())?;
        state.serialize_field("size", &self.size())?;
        state.serialize_field("sort", &self.request.sort)?;
        state.serialize_field("first", &self.is_first())?;
        state.serialize_field("last", &self.is_last())?;
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use super::{Page, PageRequest, PageRequestError, Slice};

    #[test]
    fn zero_size_is_rejected() {
        assert_eq!(PageRequest::of(0, 0), Err(PageRequestError::ZeroSize));
    }

    #[test]
    fn total_pages_rounds_up() {
        let request = PageRequest::of(0, 3).unwrap();
        let page = Page::new(vec![1, 2, 3], request, 5);
        assert_eq!(page.total_pages(), 2);
        assert!(page.is_first());
        assert!(page.has_next());

        let empty = Page::<i32>::new(Vec::new(), PageRequest::of(0, 3).unwrap(), 0);
        assert_eq!(empty.total_pages(), 0);
        assert!(empty.is_last());
    }

    #[test]
    fn map_keeps_metadata() {
        let page = Page::new(vec![1, 2], PageRequest::of(1, 2).unwrap(), 4).map(|n| n * 10);
        assert_eq!(page.content(), &[10, 20]);
        assert_eq!(page.total_elements(), 4);
        assert_eq!(page.number(), 1);
        assert!(page.is_last());
    }

    #[test]
    fn lookahead_row_is_dropped() {
        let slice = Slice::from_lookahead(vec![1, 2, 3, 4], PageRequest::of(0, 3).unwrap());
        assert_eq!(slice.content(), &[1, 2, 3]);
        assert!(slice.has_next());

        let last = Slice::from_lookahead(vec![4, 5], PageRequest::of(1, 3).unwrap());
        assert!(!last.has_next());
        assert!(last.has_previous());
    }
}
