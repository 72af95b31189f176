pub mod error;
pub mod jwt;
pub mod scheduled_executor;
pub mod string_ext;

pub use error::{ApiError, ApiResult};
pub use jwt::JwtUtil;
pub use scheduled_executor::{ScheduledExecutor, ScheduledTask};
pub use string_ext::{clean_optional_string, content_hash, is_simple_identifier, sql_hash};
