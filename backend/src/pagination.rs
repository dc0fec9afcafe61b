//! Pagination helpers for list endpoints.

use serde::Deserialize;

/// Default page size if not specified
pub const DEFAULT_PAGE_SIZE: i64 = 25;
/// Maximum allowed page size
pub const MAX_PAGE_SIZE: i64 = 100;

/// Standard pagination query parameters
#[derive(Debug, Clone, Deserialize)]
pub struct PaginationParams {
    /// Page number (1-indexed)
    #[serde(default = "default_page")]
    pub page: i64,
    /// Number of items per page
    #[serde(default = "default_page_size")]
    pub page_size: i64,
}

fn default_page() -> i64 {
    1
}

fn default_page_size() -> i64 {
    DEFAULT_PAGE_SIZE
}

impl PaginationParams {
    /// Get SQL OFFSET value
    pub fn offset(&self) -> i64 {
        (self.page.max(1) - 1) * self.limit()
    }

    /// Get SQL LIMIT value
    pub fn limit(&self) -> i64 {
        self.page_size.clamp(1, MAX_PAGE_SIZE)
    }

    pub fn page(&self) -> i64 {
        self.page.max(1)
    }

    pub fn total_pages(&self, total: i64) -> i64 {
        (total as f64 / self.limit() as f64).ceil() as i64
    }
}

impl Default for PaginationParams {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}
