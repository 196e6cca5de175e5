//! Shared Data Transfer Objects (DTOs) for API handlers.
//!
//! List endpoints use limit/offset pagination and answer with
//! `{count, next, previous, results}`, where `next` and `previous` are the
//! offsets of the neighbouring pages (or null).

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use super::handlers::accounts::AccountResponse;
use super::handlers::events::EventResponse;
use super::handlers::images::ImageResponse;
use super::handlers::instances::InstanceResponse;
use super::handlers::users::UserResponse;
use crate::services::inventory_service::{ListParams, Page};

/// Query parameters for paginated list requests.
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
pub struct PaginationQuery {
    /// Items per page (default 10, max 1000)
    pub limit: Option<i64>,
    /// Number of items to skip
    pub offset: Option<i64>,
}

impl PaginationQuery {
    pub fn params(&self) -> ListParams {
        ListParams::new(self.limit, self.offset)
    }
}

/// Query parameters for inventory lists.
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
pub struct ListQuery {
    /// Superusers only: restrict results to one user's objects
    pub user_id: Option<Uuid>,
    /// Items per page (default 10, max 1000)
    pub limit: Option<i64>,
    /// Number of items to skip
    pub offset: Option<i64>,
}

impl ListQuery {
    pub fn params(&self) -> ListParams {
        ListParams::new(self.limit, self.offset)
    }
}

/// A page of results.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[aliases(
    AccountListResponse = Paginated<AccountResponse>,
    InstanceListResponse = Paginated<InstanceResponse>,
    ImageListResponse = Paginated<ImageResponse>,
    EventListResponse = Paginated<EventResponse>,
    UserListResponse = Paginated<UserResponse>
)]
pub struct Paginated<T> {
    /// Total number of matching items
    pub count: i64,
    /// Offset of the next page
    pub next: Option<i64>,
    /// Offset of the previous page
    pub previous: Option<i64>,
    pub results: Vec<T>,
}

impl<T> Paginated<T> {
    pub fn from_page<U>(page: Page<U>, f: impl FnMut(U) -> T) -> Self {
        let next = page.next_offset();
        let previous = page.previous_offset();
        let page = page.map(f);
        Self {
            count: page.count,
            next,
            previous,
            results: page.results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination_query_defaults() {
        let params = PaginationQuery::default().params();
        assert_eq!(params.limit, 10);
        assert_eq!(params.offset, 0);

        let params = PaginationQuery {
            limit: Some(100_000),
            offset: Some(20),
        }
        .params();
        assert_eq!(params.limit, 1000);
        assert_eq!(params.offset, 20);
    }

    #[test]
    fn test_paginated_serialization() {
        let page = Page {
            count: 3,
            results: vec!["a", "b"],
            params: ListParams::new(Some(2), Some(0)),
        };
        let body = Paginated::from_page(page, |s| s.to_uppercase());
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["count"], 3);
        assert_eq!(json["next"], 2);
        assert!(json["previous"].is_null());
        assert_eq!(json["results"], serde_json::json!(["A", "B"]));
    }
}
