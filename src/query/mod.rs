pub mod filter;
pub mod aggregate;
