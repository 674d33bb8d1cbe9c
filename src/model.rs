use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

pub const FORMAT_STRING: &str = "string";
pub const FORMAT_DATE: &str = "date";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimpleEntity {
    pub id: i64,
    pub name: String,
}

impl SimpleEntity {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

impl PartialEq for SimpleEntity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SimpleEntity {}

impl Hash for SimpleEntity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomField {
    pub id: i64,
    pub name: String,
    pub multiple: bool,
    pub values: Vec<String>,
}

impl CustomField {
    pub fn single(id: i64, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            multiple: false,
            values: vec![value.into()],
        }
    }

    pub fn value(&self) -> Option<&str> {
        self.values.first().map(String::as_str)
    }

    pub fn non_blank_values(&self) -> impl Iterator<Item = &str> {
        self.values
            .iter()
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: i64,
    pub filename: String,
    pub filesize: u64,
    pub content_type: Option<String>,
    pub description: Option<String>,
    pub content_url: Option<String>,
    pub author: Option<SimpleEntity>,
    pub created_on: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JournalDetail {
    pub property: String,
    pub name: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Journal {
    pub id: i64,
    pub user: Option<SimpleEntity>,
    pub notes: Option<String>,
    pub created_on: Option<String>,
    pub private_notes: bool,
    pub details: Vec<JournalDetail>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Changeset {
    pub revision: String,
    pub user: Option<SimpleEntity>,
    pub comments: Option<String>,
    pub committed_on: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Upload {
    pub token: String,
    pub filename: String,
    pub content_type: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub subject: String,
    pub description: Option<String>,
    pub project: Option<SimpleEntity>,
    pub tracker: Option<SimpleEntity>,
    pub status: Option<SimpleEntity>,
    pub priority: Option<SimpleEntity>,
    pub author: Option<SimpleEntity>,
    pub assigned_to: Option<SimpleEntity>,
    pub category: Option<SimpleEntity>,
    pub fixed_version: Option<SimpleEntity>,
    pub parent_id: Option<i64>,
    pub start_date: Option<String>,
    pub due_date: Option<String>,
    pub done_ratio: Option<u32>,
    pub estimated_hours: Option<f64>,
    pub spent_hours: Option<f64>,
    pub is_private: bool,
    pub created_on: Option<String>,
    pub updated_on: Option<String>,
    pub closed_on: Option<String>,
    pub notes: Option<String>,
    pub custom_fields: Vec<CustomField>,
    pub attachments: Vec<Attachment>,
    pub journals: Vec<Journal>,
    pub changesets: Vec<Changeset>,
    pub allowed_statuses: Vec<SimpleEntity>,
    pub watchers: Vec<SimpleEntity>,
    pub uploads: Vec<Upload>,
}

impl Task {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            ..Self::default()
        }
    }

    pub fn project_id(&self) -> Option<i64> {
        self.project.as_ref().map(|p| p.id)
    }

    pub fn tracker_id(&self) -> Option<i64> {
        self.tracker.as_ref().map(|t| t.id)
    }

    pub fn custom_field(&self, id: i64) -> Option<&CustomField> {
        self.custom_fields.iter().find(|cf| cf.id == id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeEntry {
    pub id: i64,
    pub project: Option<SimpleEntity>,
    pub issue_id: Option<i64>,
    pub user: Option<SimpleEntity>,
    pub activity: Option<SimpleEntity>,
    pub hours: f64,
    pub comments: Option<String>,
    pub spent_on: Option<String>,
    pub created_on: Option<String>,
    pub updated_on: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionDto {
    pub id: i64,
    pub project: Option<SimpleEntity>,
    pub name: String,
    pub description: Option<String>,
    pub status: Option<String>,
    pub due_date: Option<String>,
    pub sharing: Option<String>,
    pub wiki_page_title: Option<String>,
    pub created_on: Option<String>,
    pub updated_on: Option<String>,
}

impl VersionDto {
    pub fn to_entity(&self) -> SimpleEntity {
        SimpleEntity::new(self.id, self.name.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WikiPageDto {
    pub title: String,
    pub parent_title: Option<String>,
    pub text: Option<String>,
    pub version: Option<i64>,
    pub author: Option<SimpleEntity>,
    pub comments: Option<String>,
    pub created_on: Option<String>,
    pub updated_on: Option<String>,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WikiVersionDto {
    pub version: i64,
    pub author: Option<SimpleEntity>,
    pub comments: Option<String>,
    pub updated_on: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomFieldDefinition {
    pub id: i64,
    pub name: String,
    pub field_format: String,
    #[serde(default)]
    pub is_required: bool,
    #[serde(default)]
    pub multiple: bool,
    #[serde(default)]
    pub default_value: Option<String>,
    #[serde(default)]
    pub possible_values: Vec<String>,
    #[serde(default)]
    pub tracker_ids: Vec<i64>,
    #[serde(default)]
    pub project_ids: Vec<i64>,
}

impl CustomFieldDefinition {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            field_format: FORMAT_STRING.to_string(),
            is_required: false,
            multiple: false,
            default_value: None,
            possible_values: Vec::new(),
            tracker_ids: Vec::new(),
            project_ids: Vec::new(),
        }
    }

    pub fn add_possible_value(&mut self, value: &str) -> bool {
        if self.possible_values.iter().any(|v| v == value) {
            return false;
        }
        self.possible_values.push(value.to_string());
        true
    }

    pub fn add_tracker(&mut self, tracker_id: i64) -> bool {
        push_unique(&mut self.tracker_ids, tracker_id)
    }

    pub fn add_project(&mut self, project_id: i64) -> bool {
        push_unique(&mut self.project_ids, project_id)
    }
}

fn push_unique(ids: &mut Vec<i64>, id: i64) -> bool {
    if ids.contains(&id) {
        return false;
    }
    ids.push(id);
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextMetadata {
    pub server_url: String,
    pub current_user: Option<SimpleEntity>,
    pub project: Option<SimpleEntity>,
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn simple_entity_identity_ignores_name() {
        let before = SimpleEntity::new(3, "Bug");
        let renamed = SimpleEntity::new(3, "Defect");
        assert_eq!(before, renamed);

        let set: HashSet<_> = [before, renamed, SimpleEntity::new(4, "Bug")]
            .into_iter()
            .collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn definition_sets_stay_deduplicated() {
        let mut def = CustomFieldDefinition::new(7, "Severity");
        assert!(def.add_possible_value("high"));
        assert!(!def.add_possible_value("high"));
        assert!(def.add_tracker(1));
        assert!(!def.add_tracker(1));
        assert!(def.add_project(9));
        assert!(!def.add_project(9));
        assert_eq!(def.possible_values, vec!["high"]);
        assert_eq!(def.tracker_ids, vec![1]);
        assert_eq!(def.project_ids, vec![9]);
        assert_eq!(def.field_format, FORMAT_STRING);
    }

    #[test]
    fn custom_field_skips_blank_values() {
        let cf = CustomField {
            id: 1,
            name: "Tags".into(),
            multiple: true,
            values: vec!["a".into(), "  ".into(), String::new(), "b".into()],
        };
        assert_eq!(cf.non_blank_values().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(cf.value(), Some("a"));
    }
}
