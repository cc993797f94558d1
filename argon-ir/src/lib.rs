//! Intermediate representation for generated kernel bodies:
//! types, expressions, statements and memory layouts. Independent
//! of any particular kernel generator.

pub mod data_type;
pub mod expr;
pub mod layout;
pub mod stmt;

pub use data_type::{DataType, Type};
pub use expr::{BinaryOp, Builtin, Expr, UnaryOp, Var};
pub use layout::{Block, Layout, LayoutError, MemoryDesc};
pub use stmt::{Alloc, AllocKind, For, Group, If, Label, Let, Send, SendOp, Stmt, Store};
