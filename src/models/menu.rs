use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::db::rows::{opt_uuid_text, uuid_text};
use crate::events::{Loggable, Severity};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Menu {
    pub id: Uuid,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_menu_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Loggable for Menu {
    fn entity_type() -> &'static str { "menu" }
    fn subject_id(&self) -> Uuid { self.id }
    fn severity(&self) -> Severity { Severity::Critical }
}

#[derive(Debug, Clone)]
pub struct DbMenu {
    pub id: Uuid,
    pub title: String,
    pub icon: Option<String>,
    pub path: Option<String>,
    pub sort_order: Option<i64>,
    pub parent_menu_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for DbMenu {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(DbMenu {
            id: uuid_text(row, "id")?,
            title: row.try_get("title")?,
            icon: row.try_get("icon")?,
            path: row.try_get("path")?,
            sort_order: row.try_get("sort_order")?,
            parent_menu_id: opt_uuid_text(row, "parent_menu_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl From<DbMenu> for Menu {
    fn from(db: DbMenu) -> Self {
        Menu {
            id: db.id,
            title: db.title,
            icon: db.icon,
            path: db.path,
            sort_order: db.sort_order,
            parent_menu_id: db.parent_menu_id,
            created_at: db.created_at,
            updated_at: db.updated_at,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct MenuCreateRequest {
    #[schema(example = "Reports")]
    pub title: String,
    #[schema(example = "bar-chart")]
    pub icon: Option<String>,
    #[schema(example = "/reports")]
    pub path: Option<String>,
    pub sort_order: Option<i64>,
    pub parent_menu_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct MenuUpdateRequest {
    pub title: Option<String>,
    pub icon: Option<String>,
    pub path: Option<String>,
    pub sort_order: Option<i64>,
    pub parent_menu_id: Option<Uuid>,
    /// Moves the menu back to root; `parent_menu_id: null` alone is
    /// indistinguishable from an omitted field.
    #[serde(default)]
    pub clear_parent: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AssignPermissionsToMenuRequest {
    pub permission_ids: Vec<Uuid>,
}

/// A rendered node of the permission-filtered menu tree.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MenuNode {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub children: Vec<MenuNode>,
}

/// Assemble the visible menu rows into a tree in memory.
///
/// Rows whose parent is absent from `rows` become roots: permission grants are
/// per node, not inherited, so a visible child of an invisible parent is
/// promoted rather than dropped. Siblings sort by `sort_order` ascending with
/// unordered rows after ordered ones, stable within each group.
pub fn build_menu_tree(rows: Vec<DbMenu>) -> Vec<MenuNode> {
    let visible: std::collections::HashSet<Uuid> = rows.iter().map(|m| m.id).collect();

    let mut roots: Vec<&DbMenu> = Vec::new();
    let mut children_of: std::collections::HashMap<Uuid, Vec<&DbMenu>> =
        std::collections::HashMap::new();

    for row in &rows {
        match row.parent_menu_id {
            Some(parent) if visible.contains(&parent) => {
                children_of.entry(parent).or_default().push(row);
            }
            _ => roots.push(row),
        }
    }

    fn sort_siblings(siblings: &mut [&DbMenu]) {
        // None sorts after Some; sort_by is stable so ties keep row order.
        siblings.sort_by(|a, b| match (a.sort_order, b.sort_order) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
    }

    fn render(
        node: &DbMenu,
        children_of: &std::collections::HashMap<Uuid, Vec<&DbMenu>>,
    ) -> MenuNode {
        let mut children: Vec<&DbMenu> = children_of.get(&node.id).cloned().unwrap_or_default();
        sort_siblings(&mut children);

        MenuNode {
            title: node.title.clone(),
            icon: node.icon.clone(),
            path: node.path.clone(),
            children: children
                .into_iter()
                .map(|child| render(child, children_of))
                .collect(),
        }
    }

    sort_siblings(&mut roots);
    roots.into_iter().map(|root| render(root, &children_of)).collect()
}
