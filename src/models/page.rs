use serde::{Deserialize, Serialize};

/// SQLite reads a negative `LIMIT` as "no upper bound"
const UNBOUNDED: i64 = -1;

/// Offset/limit paging parameters; a missing limit lists everything
#[derive(Debug, Clone, Copy, Deserialize, Default)]
pub struct PageQuery {
    pub offset: Option<u32>,
    pub limit: Option<u32>,
}

impl PageQuery {
    pub fn new(offset: u32, limit: u32) -> Self {
        Self {
            offset: Some(offset),
            limit: Some(limit),
        }
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.offset.unwrap_or(0))
    }

    pub fn limit(&self) -> i64 {
        self.limit.map(i64::from).unwrap_or(UNBOUNDED)
    }
}

/// One page of a listing plus the size of the whole result set
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResponse<T: Serialize> {
    pub items: Vec<T>,
    pub total_count: i64,
}

impl<T: Serialize> PageResponse<T> {
    pub fn new(items: Vec<T>, total_count: i64) -> Self {
        Self { items, total_count }
    }
}
