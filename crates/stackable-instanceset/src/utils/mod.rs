pub mod image;
pub mod sort;
