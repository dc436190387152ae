// 🏷️ Category Entity - static reference data for transaction labels
//
// Category name is a VALUE (can change), category UUID is IDENTITY (never
// changes). Entries store the category name the model suggested; the seed set
// below is what the review UI offers for re-labelling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// CATEGORY TYPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CategoryType {
    /// Expense category (money going out)
    Expense,

    /// Income category (money coming in)
    Income,

    /// Transfer between accounts (neutral)
    Transfer,
}

impl CategoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CategoryType::Expense => "Expense",
            CategoryType::Income => "Income",
            CategoryType::Transfer => "Transfer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Expense" => Some(CategoryType::Expense),
            "Income" => Some(CategoryType::Income),
            "Transfer" => Some(CategoryType::Transfer),
            _ => None,
        }
    }
}

// ============================================================================
// CATEGORY ENTITY
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    /// Stable identity (UUID) - never changes
    pub id: String,

    /// Category name (unique, e.g. "Groceries")
    pub name: String,

    /// Type of category (Expense, Income, Transfer)
    pub category_type: CategoryType,

    /// Optional icon for UI (e.g. "🛒")
    pub icon: Option<String>,

    /// Optional color for UI (e.g. "#4CAF50")
    pub color: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl Category {
    /// Create new category entity with UUID
    pub fn new(name: &str, category_type: CategoryType) -> Self {
        Category {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            category_type,
            icon: None,
            color: None,
            created_at: Utc::now(),
        }
    }

    /// Create category with icon and color
    pub fn with_display(
        name: &str,
        category_type: CategoryType,
        icon: &str,
        color: &str,
    ) -> Self {
        let mut category = Self::new(name, category_type);
        category.icon = Some(icon.to_string());
        category.color = Some(color.to_string());
        category
    }
}

// ============================================================================
// DEFAULT CATEGORY SET
// ============================================================================

/// Seed set inserted at database setup (idempotent, keyed by unique name)
pub fn default_categories() -> Vec<Category> {
    vec![
        Category::with_display("Groceries", CategoryType::Expense, "🛒", "#4CAF50"),
        Category::with_display("Restaurants", CategoryType::Expense, "🍴", "#FF6B4A"),
        Category::with_display("Transport", CategoryType::Expense, "🚗", "#2196F3"),
        Category::with_display("Travel", CategoryType::Expense, "✈️", "#00BCD4"),
        Category::with_display("Shopping", CategoryType::Expense, "🛍️", "#9C27B0"),
        Category::with_display("Utilities", CategoryType::Expense, "💡", "#FFC107"),
        Category::with_display("Health", CategoryType::Expense, "🏥", "#E91E63"),
        Category::with_display("Entertainment", CategoryType::Expense, "🎬", "#673AB7"),
        Category::with_display("Subscriptions", CategoryType::Expense, "📺", "#795548"),
        Category::with_display("Fees & Interest", CategoryType::Expense, "🏦", "#607D8B"),
        Category::with_display("Salary", CategoryType::Income, "💰", "#8BC34A"),
        Category::with_display("Refunds", CategoryType::Income, "↩️", "#CDDC39"),
        Category::with_display("Transfer", CategoryType::Transfer, "🔁", "#9E9E9E"),
    ]
}
