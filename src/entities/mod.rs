// Entity Models - static reference data
//
// Categories keep a stable UUID identity; the display name is a value that
// can change without breaking entries that point at it.

pub mod category;

pub use category::{default_categories, Category, CategoryType};
