pub mod mem;
pub mod page;
