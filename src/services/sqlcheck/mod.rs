//! SQL consistency checks: metadata/projection agreement, warehouse-side
//! validation via EXPLAIN, and the pagination/sort envelope.

pub mod metadata;
pub mod paginate;
pub mod validator;

pub use metadata::{MetadataError, ValidationReport, ensure_valid, output_columns, validate};
pub use paginate::{PageQuery, PaginateError, SortOrder, build as build_page_query};
pub use validator::{ErrorClass, SqlValidation, SqlValidator, classify_error};
