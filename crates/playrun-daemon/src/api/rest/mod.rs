//! REST surface under `/api/v2`

pub mod handlers;
pub mod router;
pub mod state;
