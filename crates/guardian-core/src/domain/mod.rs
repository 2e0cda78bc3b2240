//! 보호 엔진의 핵심 도메인 모델.

pub mod order;
pub mod position;
pub mod protection;
pub mod state;

pub use order::*;
pub use position::*;
pub use protection::*;
pub use state::*;
