//! Relational catalog model.
//!
//! Pure data and structural operations on tables, columns, indexes, foreign
//! keys and constraints. Nothing here performs I/O.

mod catalog;
mod column;
mod constraint;
mod foreign_key;
mod index;
mod table;
mod types;

pub use catalog::Catalog;
pub use column::{ColumnDef, ColumnHint};
pub use constraint::{ConstraintDef, ConstraintKind};
pub use foreign_key::{default_foreign_key_name, ForeignKeyDef, ReferentialAction};
pub use index::{default_index_name, IndexDef, IndexKind};
pub use table::TableDef;
pub use types::DataType;
