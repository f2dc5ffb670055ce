pub mod bsi;
pub mod dictionary;
