//! Translation between Redmine JSON payloads and the domain model.
//!
//! Decoding is deliberately forgiving. Payloads are parsed structurally, so a
//! nested object's `id` can never be mistaken for its parent's, and each list
//! element is decoded on its own: elements that fail to decode or carry no
//! identity are dropped, the rest of the page survives. Inside an element, a
//! field of the wrong type (`"done_ratio": 50.0`, `"hours": "1.5"`) is coerced
//! where that is lossless and left empty otherwise. A payload that is not JSON
//! at all decodes to an empty result.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::model::{
    Attachment, Changeset, CustomField, CustomFieldDefinition, Journal, JournalDetail,
    SimpleEntity, Task, TimeEntry, Upload, VersionDto, WikiPageDto, FORMAT_STRING,
};

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub received: usize,
    pub total_count: Option<usize>,
}

impl<T> Default for Page<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            received: 0,
            total_count: None,
        }
    }
}

pub fn decode_task_page(json: &str) -> Page<Task> {
    decode_page(json, "issues", WireIssue::into_task)
}

pub fn decode_tasks(json: &str) -> Vec<Task> {
    decode_task_page(json).items
}

pub fn decode_task(json: &str) -> Option<Task> {
    decode_single(json, "issue", WireIssue::into_task)
}

pub fn decode_time_entry_page(json: &str) -> Page<TimeEntry> {
    decode_page(json, "time_entries", WireTimeEntry::into_entry)
}

pub fn decode_time_entry(json: &str) -> Option<TimeEntry> {
    decode_single(json, "time_entry", WireTimeEntry::into_entry)
}

pub fn decode_versions(json: &str) -> Vec<VersionDto> {
    decode_page(json, "versions", WireVersion::into_version).items
}

pub fn decode_version(json: &str) -> Option<VersionDto> {
    decode_single(json, "version", WireVersion::into_version)
}

pub fn decode_wiki_index(json: &str) -> Vec<WikiPageDto> {
    decode_page(json, "wiki_pages", WireWikiPage::into_page).items
}

pub fn decode_wiki_page(json: &str) -> Option<WikiPageDto> {
    decode_single(json, "wiki_page", WireWikiPage::into_page)
}

pub fn decode_attachment(json: &str) -> Option<Attachment> {
    decode_single(json, "attachment", WireAttachment::into_attachment)
}

pub fn decode_custom_field_definitions(json: &str) -> Vec<CustomFieldDefinition> {
    decode_page(json, "custom_fields", WireFieldDefinition::into_definition).items
}

pub fn decode_entities(json: &str, key: &str) -> Vec<SimpleEntity> {
    decode_page(json, key, WireRef::into_entity).items
}

pub fn decode_membership_page(json: &str) -> Page<SimpleEntity> {
    decode_page(json, "memberships", |m: WireMembership| {
        m.user.and_then(WireRef::into_entity)
    })
}

pub fn decode_project(json: &str) -> Option<SimpleEntity> {
    decode_single(json, "project", |p: WireProject| {
        let id = p.id?;
        let name = p.name.or(p.identifier).unwrap_or_default();
        Some(SimpleEntity::new(id, name))
    })
}

pub fn decode_project_trackers(json: &str) -> Vec<SimpleEntity> {
    decode_single(json, "project", |p: WireProject| {
        Some(
            p.trackers
                .into_iter()
                .filter_map(WireRef::into_entity)
                .collect::<Vec<_>>(),
        )
    })
    .unwrap_or_default()
}

pub fn decode_current_user(json: &str) -> Option<SimpleEntity> {
    decode_single(json, "user", WireUser::into_entity)
}

pub fn decode_upload_token(json: &str) -> Option<String> {
    let root = parse_root(json)?;
    root.get("upload")?
        .get("token")?
        .as_str()
        .filter(|token| !token.is_empty())
        .map(ToString::to_string)
}

pub fn decode_error_messages(json: &str) -> Vec<String> {
    let Some(root) = parse_root(json) else {
        return Vec::new();
    };
    collection(&root, "errors")
        .iter()
        .filter_map(Value::as_str)
        .map(ToString::to_string)
        .collect()
}

pub fn encode_task_for_create(project_id: &str, task: &Task) -> serde_json::Result<String> {
    let mut issue = IssueWrite::from_task(task);
    issue.project_id = Some(project_ref(project_id));
    serde_json::to_string(&IssueEnvelope { issue })
}

pub fn encode_task_for_update(task: &Task) -> serde_json::Result<String> {
    let mut issue = IssueWrite::from_task(task);
    issue.notes = task.notes.as_deref().filter(|n| !n.trim().is_empty());
    serde_json::to_string(&IssueEnvelope { issue })
}

pub fn encode_version(version: &VersionDto) -> serde_json::Result<String> {
    serde_json::to_string(&VersionEnvelope {
        version: VersionWrite {
            name: Some(version.name.as_str()).filter(|n| !n.is_empty()),
            description: version.description.as_deref(),
            status: version.status.as_deref(),
            due_date: version.due_date.as_deref(),
            sharing: version.sharing.as_deref(),
            wiki_page_title: version.wiki_page_title.as_deref(),
        },
    })
}

pub fn encode_wiki_page(page: &WikiPageDto, uploads: &[Upload]) -> serde_json::Result<String> {
    serde_json::to_string(&WikiEnvelope {
        wiki_page: WikiWrite {
            text: page.text.as_deref().unwrap_or_default(),
            comments: page.comments.as_deref().filter(|c| !c.is_empty()),
            version: page.version,
            parent_title: page.parent_title.as_deref(),
            uploads: uploads.iter().map(UploadWrite::from).collect(),
        },
    })
}

pub fn encode_time_entry(entry: &TimeEntry) -> serde_json::Result<String> {
    let project_id = if entry.issue_id.is_none() {
        entry.project.as_ref().map(|p| p.id)
    } else {
        None
    };
    serde_json::to_string(&TimeEntryEnvelope {
        time_entry: TimeEntryWrite {
            issue_id: entry.issue_id,
            project_id,
            spent_on: entry.spent_on.as_deref(),
            hours: entry.hours,
            activity_id: entry.activity.as_ref().map(|a| a.id),
            comments: entry.comments.as_deref(),
        },
    })
}

fn parse_root(json: &str) -> Option<Value> {
    if json.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(json) {
        Ok(root) => Some(root),
        Err(err) => {
            warn!(error = %err, bytes = json.len(), "discarding malformed payload");
            None
        }
    }
}

fn collection<'a>(root: &'a Value, key: &str) -> &'a [Value] {
    match root {
        Value::Array(items) => items,
        Value::Object(map) => map
            .get(key)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default(),
        _ => &[],
    }
}

fn decode_item<W: DeserializeOwned>(item: &Value) -> Option<W> {
    match W::deserialize(item) {
        Ok(wire) => Some(wire),
        Err(err) => {
            debug!(error = %err, "skipping undecodable element");
            None
        }
    }
}

fn decode_page<W, T>(json: &str, key: &str, convert: impl Fn(W) -> Option<T>) -> Page<T>
where
    W: DeserializeOwned,
{
    let Some(root) = parse_root(json) else {
        return Page::default();
    };
    let raw = collection(&root, key);
    Page {
        items: raw
            .iter()
            .filter_map(decode_item::<W>)
            .filter_map(convert)
            .collect(),
        received: raw.len(),
        total_count: root
            .get("total_count")
            .and_then(Value::as_u64)
            .and_then(|n| usize::try_from(n).ok()),
    }
}

fn decode_single<W, T>(json: &str, key: &str, convert: impl Fn(W) -> Option<T>) -> Option<T>
where
    W: DeserializeOwned,
{
    let root = parse_root(json)?;
    let object = match root.get(key) {
        Some(inner) => inner,
        None => &root,
    };
    if !object.is_object() {
        return None;
    }
    decode_item::<W>(object).and_then(convert)
}

fn lenient_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let raw = Value::deserialize(deserializer)?;
    Ok(match raw {
        Value::Array(items) => items.iter().filter_map(decode_item).collect(),
        _ => Vec::new(),
    })
}

// Any value `T` does not accept decodes to `None` instead of failing the parent.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let raw = Value::deserialize(deserializer)?;
    Ok(T::deserialize(&raw).ok())
}

fn number_of(raw: &Value) -> Option<f64> {
    match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|n| n.is_finite())
}

fn whole_number_of(raw: &Value) -> Option<i64> {
    if let Some(n) = raw.as_i64() {
        return Some(n);
    }
    if let Some(n) = raw.as_str().and_then(|s| s.trim().parse::<i64>().ok()) {
        return Some(n);
    }
    number_of(raw)
        .filter(|n| n.fract() == 0.0 && *n >= i64::MIN as f64 && *n <= i64::MAX as f64)
        .map(|n| n as i64)
}

fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    Ok(number_of(&Value::deserialize(deserializer)?))
}

fn lenient_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    Ok(whole_number_of(&Value::deserialize(deserializer)?))
}

fn lenient_u32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
    Ok(whole_number_of(&Value::deserialize(deserializer)?).and_then(|n| u32::try_from(n).ok()))
}

fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    Ok(whole_number_of(&Value::deserialize(deserializer)?).and_then(|n| u64::try_from(n).ok()))
}

fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<bool>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(b) => Some(b),
        Value::String(s) => match s.trim() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_i64().filter(|n| *n == 0 || *n == 1).map(|n| n == 1),
        _ => None,
    })
}

fn value_strings(value: &Value) -> Vec<String> {
    match value {
        Value::Null | Value::Object(_) => Vec::new(),
        Value::String(s) => vec![s.clone()],
        Value::Bool(b) => vec![b.to_string()],
        Value::Number(n) => vec![n.to_string()],
        Value::Array(items) => items.iter().flat_map(value_strings).collect(),
    }
}

fn project_ref(project_id: &str) -> Value {
    let trimmed = project_id.trim();
    trimmed
        .parse::<i64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::from(trimmed))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireRef {
    id: Option<i64>,
    name: Option<String>,
}

impl WireRef {
    fn into_entity(self) -> Option<SimpleEntity> {
        let id = self.id?;
        Some(SimpleEntity::new(id, self.name.unwrap_or_default()))
    }
}

fn entity(wire: Option<WireRef>) -> Option<SimpleEntity> {
    wire.and_then(WireRef::into_entity)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireIssue {
    id: Option<i64>,
    #[serde(deserialize_with = "lenient")]
    subject: Option<String>,
    #[serde(deserialize_with = "lenient")]
    description: Option<String>,
    #[serde(deserialize_with = "lenient")]
    project: Option<WireRef>,
    #[serde(deserialize_with = "lenient")]
    tracker: Option<WireRef>,
    #[serde(deserialize_with = "lenient")]
    status: Option<WireRef>,
    #[serde(deserialize_with = "lenient")]
    priority: Option<WireRef>,
    #[serde(deserialize_with = "lenient")]
    author: Option<WireRef>,
    #[serde(deserialize_with = "lenient")]
    assigned_to: Option<WireRef>,
    #[serde(deserialize_with = "lenient")]
    category: Option<WireRef>,
    #[serde(deserialize_with = "lenient")]
    fixed_version: Option<WireRef>,
    #[serde(deserialize_with = "lenient")]
    parent: Option<WireRef>,
    #[serde(deserialize_with = "lenient")]
    start_date: Option<String>,
    #[serde(deserialize_with = "lenient")]
    due_date: Option<String>,
    #[serde(deserialize_with = "lenient_u32")]
    done_ratio: Option<u32>,
    #[serde(deserialize_with = "lenient_f64")]
    estimated_hours: Option<f64>,
    #[serde(deserialize_with = "lenient_f64")]
    spent_hours: Option<f64>,
    #[serde(deserialize_with = "lenient_bool")]
    is_private: Option<bool>,
    #[serde(deserialize_with = "lenient")]
    created_on: Option<String>,
    #[serde(deserialize_with = "lenient")]
    updated_on: Option<String>,
    #[serde(deserialize_with = "lenient")]
    closed_on: Option<String>,
    #[serde(deserialize_with = "lenient_vec")]
    custom_fields: Vec<WireCustomField>,
    #[serde(deserialize_with = "lenient_vec")]
    attachments: Vec<WireAttachment>,
    #[serde(deserialize_with = "lenient_vec")]
    journals: Vec<WireJournal>,
    #[serde(deserialize_with = "lenient_vec")]
    changesets: Vec<WireChangeset>,
    #[serde(deserialize_with = "lenient_vec")]
    allowed_statuses: Vec<WireRef>,
    #[serde(deserialize_with = "lenient_vec")]
    watchers: Vec<WireRef>,
}

impl WireIssue {
    fn into_task(self) -> Option<Task> {
        let id = self.id.filter(|id| *id > 0)?;
        Some(Task {
            id,
            subject: self.subject.unwrap_or_default(),
            description: self.description,
            project: entity(self.project),
            tracker: entity(self.tracker),
            status: entity(self.status),
            priority: entity(self.priority),
            author: entity(self.author),
            assigned_to: entity(self.assigned_to),
            category: entity(self.category),
            fixed_version: entity(self.fixed_version),
            parent_id: self.parent.and_then(|p| p.id),
            start_date: self.start_date,
            due_date: self.due_date,
            done_ratio: self.done_ratio,
            estimated_hours: self.estimated_hours,
            spent_hours: self.spent_hours,
            is_private: self.is_private.unwrap_or(false),
            created_on: self.created_on,
            updated_on: self.updated_on,
            closed_on: self.closed_on,
            notes: None,
            custom_fields: self
                .custom_fields
                .into_iter()
                .filter_map(WireCustomField::into_field)
                .collect(),
            attachments: self
                .attachments
                .into_iter()
                .filter_map(WireAttachment::into_attachment)
                .collect(),
            journals: self
                .journals
                .into_iter()
                .filter_map(WireJournal::into_journal)
                .collect(),
            changesets: self
                .changesets
                .into_iter()
                .filter_map(WireChangeset::into_changeset)
                .collect(),
            allowed_statuses: self
                .allowed_statuses
                .into_iter()
                .filter_map(WireRef::into_entity)
                .collect(),
            watchers: self
                .watchers
                .into_iter()
                .filter_map(WireRef::into_entity)
                .collect(),
            uploads: Vec::new(),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireCustomField {
    id: Option<i64>,
    #[serde(deserialize_with = "lenient")]
    name: Option<String>,
    #[serde(deserialize_with = "lenient_bool")]
    multiple: Option<bool>,
    value: Value,
}

impl WireCustomField {
    fn into_field(self) -> Option<CustomField> {
        Some(CustomField {
            id: self.id?,
            name: self.name.unwrap_or_default(),
            multiple: self.multiple.unwrap_or_else(|| self.value.is_array()),
            values: value_strings(&self.value),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireAttachment {
    id: Option<i64>,
    #[serde(deserialize_with = "lenient")]
    filename: Option<String>,
    #[serde(deserialize_with = "lenient_u64")]
    filesize: Option<u64>,
    #[serde(deserialize_with = "lenient")]
    content_type: Option<String>,
    #[serde(deserialize_with = "lenient")]
    description: Option<String>,
    #[serde(deserialize_with = "lenient")]
    content_url: Option<String>,
    #[serde(deserialize_with = "lenient")]
    author: Option<WireRef>,
    #[serde(deserialize_with = "lenient")]
    created_on: Option<String>,
}

impl WireAttachment {
    fn into_attachment(self) -> Option<Attachment> {
        Some(Attachment {
            id: self.id?,
            filename: self.filename.unwrap_or_default(),
            filesize: self.filesize.unwrap_or(0),
            content_type: self.content_type,
            description: self.description.filter(|d| !d.is_empty()),
            content_url: self.content_url,
            author: entity(self.author),
            created_on: self.created_on,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireJournal {
    id: Option<i64>,
    #[serde(deserialize_with = "lenient")]
    user: Option<WireRef>,
    #[serde(deserialize_with = "lenient")]
    notes: Option<String>,
    #[serde(deserialize_with = "lenient")]
    created_on: Option<String>,
    #[serde(deserialize_with = "lenient_bool")]
    private_notes: Option<bool>,
    #[serde(deserialize_with = "lenient_vec")]
    details: Vec<WireJournalDetail>,
}

impl WireJournal {
    fn into_journal(self) -> Option<Journal> {
        Some(Journal {
            id: self.id?,
            user: entity(self.user),
            notes: self.notes.filter(|n| !n.is_empty()),
            created_on: self.created_on,
            private_notes: self.private_notes.unwrap_or(false),
            details: self
                .details
                .into_iter()
                .map(|d| JournalDetail {
                    property: d.property.unwrap_or_default(),
                    name: d.name.unwrap_or_default(),
                    old_value: d.old_value,
                    new_value: d.new_value,
                })
                .collect(),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireJournalDetail {
    property: Option<String>,
    name: Option<String>,
    old_value: Option<String>,
    new_value: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireChangeset {
    revision: Option<String>,
    user: Option<WireRef>,
    comments: Option<String>,
    committed_on: Option<String>,
}

impl WireChangeset {
    fn into_changeset(self) -> Option<Changeset> {
        Some(Changeset {
            revision: self.revision?,
            user: entity(self.user),
            comments: self.comments,
            committed_on: self.committed_on,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireTimeEntry {
    id: Option<i64>,
    #[serde(deserialize_with = "lenient")]
    project: Option<WireRef>,
    #[serde(deserialize_with = "lenient")]
    issue: Option<WireRef>,
    #[serde(deserialize_with = "lenient")]
    user: Option<WireRef>,
    #[serde(deserialize_with = "lenient")]
    activity: Option<WireRef>,
    #[serde(deserialize_with = "lenient_f64")]
    hours: Option<f64>,
    #[serde(deserialize_with = "lenient")]
    comments: Option<String>,
    #[serde(deserialize_with = "lenient")]
    spent_on: Option<String>,
    #[serde(deserialize_with = "lenient")]
    created_on: Option<String>,
    #[serde(deserialize_with = "lenient")]
    updated_on: Option<String>,
}

impl WireTimeEntry {
    fn into_entry(self) -> Option<TimeEntry> {
        Some(TimeEntry {
            id: self.id?,
            project: entity(self.project),
            issue_id: self.issue.and_then(|i| i.id),
            user: entity(self.user),
            activity: entity(self.activity),
            hours: self.hours.unwrap_or(0.0),
            comments: self.comments,
            spent_on: self.spent_on,
            created_on: self.created_on,
            updated_on: self.updated_on,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireVersion {
    id: Option<i64>,
    #[serde(deserialize_with = "lenient")]
    project: Option<WireRef>,
    #[serde(deserialize_with = "lenient")]
    name: Option<String>,
    #[serde(deserialize_with = "lenient")]
    description: Option<String>,
    #[serde(deserialize_with = "lenient")]
    status: Option<String>,
    #[serde(deserialize_with = "lenient")]
    due_date: Option<String>,
    #[serde(deserialize_with = "lenient")]
    sharing: Option<String>,
    #[serde(deserialize_with = "lenient")]
    wiki_page_title: Option<String>,
    #[serde(deserialize_with = "lenient")]
    created_on: Option<String>,
    #[serde(deserialize_with = "lenient")]
    updated_on: Option<String>,
}

impl WireVersion {
    fn into_version(self) -> Option<VersionDto> {
        Some(VersionDto {
            id: self.id?,
            project: entity(self.project),
            name: self.name.unwrap_or_default(),
            description: self.description.filter(|d| !d.is_empty()),
            status: self.status,
            due_date: self.due_date,
            sharing: self.sharing,
            wiki_page_title: self.wiki_page_title.filter(|t| !t.is_empty()),
            created_on: self.created_on,
            updated_on: self.updated_on,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireTitle {
    title: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireWikiPage {
    #[serde(deserialize_with = "lenient")]
    title: Option<String>,
    #[serde(deserialize_with = "lenient")]
    parent: Option<WireTitle>,
    #[serde(deserialize_with = "lenient")]
    text: Option<String>,
    #[serde(deserialize_with = "lenient_i64")]
    version: Option<i64>,
    #[serde(deserialize_with = "lenient")]
    author: Option<WireRef>,
    #[serde(deserialize_with = "lenient")]
    comments: Option<String>,
    #[serde(deserialize_with = "lenient")]
    created_on: Option<String>,
    #[serde(deserialize_with = "lenient")]
    updated_on: Option<String>,
    #[serde(deserialize_with = "lenient_vec")]
    attachments: Vec<WireAttachment>,
}

impl WireWikiPage {
    fn into_page(self) -> Option<WikiPageDto> {
        let title = self.title.filter(|t| !t.trim().is_empty())?;
        Some(WikiPageDto {
            title,
            parent_title: self.parent.and_then(|p| p.title),
            text: self.text,
            version: self.version,
            author: entity(self.author),
            comments: self.comments.filter(|c| !c.is_empty()),
            created_on: self.created_on,
            updated_on: self.updated_on,
            attachments: self
                .attachments
                .into_iter()
                .filter_map(WireAttachment::into_attachment)
                .collect(),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireFieldDefinition {
    id: Option<i64>,
    #[serde(deserialize_with = "lenient")]
    name: Option<String>,
    #[serde(deserialize_with = "lenient")]
    customized_type: Option<String>,
    #[serde(deserialize_with = "lenient")]
    field_format: Option<String>,
    #[serde(deserialize_with = "lenient_bool")]
    is_required: Option<bool>,
    #[serde(deserialize_with = "lenient_bool")]
    multiple: Option<bool>,
    default_value: Value,
    possible_values: Value,
    #[serde(deserialize_with = "lenient_vec")]
    trackers: Vec<WireRef>,
    #[serde(deserialize_with = "lenient_vec")]
    projects: Vec<WireRef>,
}

impl WireFieldDefinition {
    fn into_definition(self) -> Option<CustomFieldDefinition> {
        if self
            .customized_type
            .as_deref()
            .is_some_and(|kind| kind != "issue")
        {
            return None;
        }
        let mut def = CustomFieldDefinition::new(self.id?, self.name.unwrap_or_default());
        def.field_format = self
            .field_format
            .filter(|f| !f.is_empty())
            .unwrap_or_else(|| FORMAT_STRING.to_string());
        def.is_required = self.is_required.unwrap_or(false);
        def.multiple = self.multiple.unwrap_or(false);
        def.default_value = value_strings(&self.default_value)
            .into_iter()
            .next()
            .filter(|v| !v.is_empty());
        for value in possible_value_strings(&self.possible_values) {
            def.add_possible_value(&value);
        }
        for tracker in self.trackers.into_iter().filter_map(|t| t.id) {
            def.add_tracker(tracker);
        }
        for project in self.projects.into_iter().filter_map(|p| p.id) {
            def.add_project(project);
        }
        Some(def)
    }
}

fn possible_value_strings(raw: &Value) -> Vec<String> {
    let Value::Array(items) = raw else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::Object(map) => map.get("value").and_then(Value::as_str),
            Value::String(s) => Some(s.as_str()),
            _ => None,
        })
        .filter(|v| !v.trim().is_empty())
        .map(ToString::to_string)
        .collect()
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireMembership {
    user: Option<WireRef>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireProject {
    id: Option<i64>,
    name: Option<String>,
    identifier: Option<String>,
    #[serde(deserialize_with = "lenient_vec")]
    trackers: Vec<WireRef>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireUser {
    id: Option<i64>,
    login: Option<String>,
    firstname: Option<String>,
    lastname: Option<String>,
}

impl WireUser {
    fn into_entity(self) -> Option<SimpleEntity> {
        let id = self.id?;
        let full_name = [self.firstname, self.lastname]
            .into_iter()
            .flatten()
            .filter(|part| !part.trim().is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        let name = if full_name.is_empty() {
            self.login.unwrap_or_default()
        } else {
            full_name
        };
        Some(SimpleEntity::new(id, name))
    }
}

#[derive(Debug, Serialize)]
struct IssueEnvelope<'a> {
    issue: IssueWrite<'a>,
}

#[derive(Debug, Default, Serialize)]
struct IssueWrite<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    project_id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    subject: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tracker_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    priority_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    assigned_to_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    category_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fixed_version_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_issue_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_date: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    due_date: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    done_ratio: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    estimated_hours: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    is_private: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    notes: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    custom_fields: Vec<CustomFieldWrite>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    uploads: Vec<UploadWrite<'a>>,
}

impl<'a> IssueWrite<'a> {
    fn from_task(task: &'a Task) -> Self {
        Self {
            subject: Some(task.subject.as_str()).filter(|s| !s.trim().is_empty()),
            description: task.description.as_deref(),
            tracker_id: task.tracker.as_ref().map(|e| e.id),
            status_id: task.status.as_ref().map(|e| e.id),
            priority_id: task.priority.as_ref().map(|e| e.id),
            assigned_to_id: task.assigned_to.as_ref().map(|e| e.id),
            category_id: task.category.as_ref().map(|e| e.id),
            fixed_version_id: task.fixed_version.as_ref().map(|e| e.id),
            parent_issue_id: task.parent_id,
            start_date: task.start_date.as_deref(),
            due_date: task.due_date.as_deref(),
            done_ratio: task.done_ratio,
            estimated_hours: task.estimated_hours,
            is_private: task.is_private.then_some(true),
            custom_fields: task
                .custom_fields
                .iter()
                .map(CustomFieldWrite::from)
                .collect(),
            uploads: task.uploads.iter().map(UploadWrite::from).collect(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize)]
struct CustomFieldWrite {
    id: i64,
    value: Value,
}

impl From<&CustomField> for CustomFieldWrite {
    fn from(field: &CustomField) -> Self {
        let value = if field.multiple {
            Value::from(field.values.clone())
        } else {
            Value::from(field.value().unwrap_or_default())
        };
        Self { id: field.id, value }
    }
}

#[derive(Debug, Serialize)]
struct UploadWrite<'a> {
    token: &'a str,
    filename: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
}

impl<'a> From<&'a Upload> for UploadWrite<'a> {
    fn from(upload: &'a Upload) -> Self {
        Self {
            token: &upload.token,
            filename: &upload.filename,
            content_type: upload.content_type.as_deref(),
            description: upload.description.as_deref(),
        }
    }
}

#[derive(Debug, Serialize)]
struct VersionEnvelope<'a> {
    version: VersionWrite<'a>,
}

#[derive(Debug, Serialize)]
struct VersionWrite<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    due_date: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sharing: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    wiki_page_title: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct WikiEnvelope<'a> {
    wiki_page: WikiWrite<'a>,
}

#[derive(Debug, Serialize)]
struct WikiWrite<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    comments: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_title: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    uploads: Vec<UploadWrite<'a>>,
}

#[derive(Debug, Serialize)]
struct TimeEntryEnvelope<'a> {
    time_entry: TimeEntryWrite<'a>,
}

#[derive(Debug, Serialize)]
struct TimeEntryWrite<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    issue_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    project_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    spent_on: Option<&'a str>,
    hours: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    activity_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    comments: Option<&'a str>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn outer_id_wins_over_preceding_nested_ids() {
        let raw = r#"{"custom_fields":[{"id":999,"name":"X","value":"v"}],"attachments":[{"id":555,"filename":"a.txt"}],"id":1,"subject":"Real"}"#;
        let task = decode_task(raw).expect("task decodes");
        assert_eq!(task.id, 1);
        assert_eq!(task.subject, "Real");
        assert_eq!(task.custom_fields[0].id, 999);
        assert_eq!(task.attachments[0].id, 555);

        let listed = decode_tasks(&format!(r#"{{"issues":[{raw}],"total_count":1}}"#));
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, 1);
    }

    #[test]
    fn skips_elements_without_identity() {
        let tasks = decode_tasks(r#"{"issues":[{},{"id":5}]}"#);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, 5);
        assert_eq!(tasks[0].subject, "");
    }

    #[test]
    fn skips_elements_with_wrong_shapes_but_keeps_the_page() {
        let page = decode_task_page(
            r#"{"issues":[{"id":"not-a-number"},{"id":2,"subject":"ok"},42],"total_count":10}"#,
        );
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id, 2);
        assert_eq!(page.received, 3);
        assert_eq!(page.total_count, Some(10));
    }

    #[test]
    fn mistyped_scalars_degrade_to_partial_records() {
        let listed = decode_tasks(
            r#"{"issues":[
                {"id":5,"subject":"float ratio","done_ratio":50.0},
                {"id":6,"subject":"string hours","estimated_hours":"1.5","is_private":"yes"},
                {"id":8,"subject":7,"project":"ops","spent_hours":{"h":1},"done_ratio":-3}
            ]}"#,
        );
        let ids: Vec<i64> = listed.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![5, 6, 8]);
        assert_eq!(listed[0].done_ratio, Some(50));
        assert_eq!(listed[1].estimated_hours, Some(1.5));
        assert!(!listed[1].is_private);
        assert_eq!(listed[2].subject, "");
        assert!(listed[2].project.is_none());
        assert_eq!(listed[2].spent_hours, None);
        assert_eq!(listed[2].done_ratio, None);

        let single = decode_task(r#"{"issue":{"id":7,"spent_hours":"0.0","done_ratio":"40"}}"#)
            .expect("task decodes despite string scalars");
        assert_eq!(single.id, 7);
        assert_eq!(single.spent_hours, Some(0.0));
        assert_eq!(single.done_ratio, Some(40));

        let entry = decode_time_entry(r#"{"time_entry":{"id":3,"hours":"2.25","spent_on":20260301}}"#)
            .expect("time entry");
        assert_eq!(entry.hours, 2.25);
        assert_eq!(entry.spent_on, None);

        let page = decode_wiki_page(r#"{"wiki_page":{"title":"Home","version":"4","attachments":[{"id":1,"filesize":"12"}]}}"#)
            .expect("wiki page");
        assert_eq!(page.version, Some(4));
        assert_eq!(page.attachments[0].filesize, 12);
    }

    #[test]
    fn empty_absent_and_malformed_payloads_decode_to_nothing() {
        assert!(decode_tasks(r#"{"issues":[]}"#).is_empty());
        assert!(decode_tasks(r#"{"total_count":0}"#).is_empty());
        assert!(decode_tasks(r#"{"issues":[{"id":1,"subj"#).is_empty());
        assert!(decode_tasks("").is_empty());
        assert!(decode_task(r#"{"issue":null}"#).is_none());
        assert!(decode_versions("<html>502</html>").is_empty());
    }

    #[test]
    fn unescapes_control_sequences_in_strings() {
        let task = decode_task(
            r#"{"issue":{"id":3,"subject":"a\"b","description":"line1\nline2\tend é"}}"#,
        )
        .expect("task decodes");
        assert_eq!(task.subject, "a\"b");
        assert_eq!(task.description.as_deref(), Some("line1\nline2\tend é"));
    }

    #[test]
    fn decodes_issue_detail_with_nested_collections() {
        let raw = json!({
            "issue": {
                "id": 42,
                "project": {"id": 7, "name": "Ops"},
                "tracker": {"id": 1, "name": "Bug"},
                "status": {"id": 2, "name": "In Progress"},
                "assigned_to": null,
                "parent": {"id": 40},
                "subject": "Broken build",
                "done_ratio": 30,
                "estimated_hours": 2.5,
                "custom_fields": [
                    {"id": 3, "name": "Tags", "multiple": true, "value": ["a", "b"]},
                    {"id": 4, "name": "Due", "value": "2026-01-02"},
                    {"id": 5, "name": "Empty", "value": null}
                ],
                "journals": [{
                    "id": 900,
                    "user": {"id": 8, "name": "Kim"},
                    "notes": "",
                    "details": [{"property": "attr", "name": "status_id", "old_value": "1", "new_value": "2"}]
                }],
                "changesets": [{"revision": "abc123", "comments": "fix"}],
                "allowed_statuses": [{"id": 2, "name": "In Progress"}, {"id": 5, "name": "Closed"}]
            }
        })
        .to_string();

        let task = decode_task(&raw).expect("task decodes");
        assert_eq!(task.id, 42);
        assert_eq!(task.project_id(), Some(7));
        assert_eq!(task.tracker_id(), Some(1));
        assert!(task.assigned_to.is_none());
        assert_eq!(task.parent_id, Some(40));
        assert_eq!(task.done_ratio, Some(30));
        assert_eq!(task.custom_fields.len(), 3);
        assert!(task.custom_fields[0].multiple);
        assert_eq!(task.custom_fields[0].values, vec!["a", "b"]);
        assert_eq!(task.custom_fields[1].value(), Some("2026-01-02"));
        assert!(task.custom_fields[2].values.is_empty());
        assert_eq!(task.journals[0].notes, None);
        assert_eq!(task.journals[0].details[0].new_value.as_deref(), Some("2"));
        assert_eq!(task.changesets[0].revision, "abc123");
        assert_eq!(task.allowed_statuses.len(), 2);
    }

    #[test]
    fn create_payload_is_minimal_and_escaped() {
        let mut task = Task::new("Quote \" and\nnewline");
        task.description = Some("tab\there".into());
        task.tracker = Some(SimpleEntity::new(2, "Feature"));
        task.custom_fields = vec![
            CustomField::single(10, "Severity", "high"),
            CustomField {
                id: 11,
                name: "Tags".into(),
                multiple: true,
                values: vec!["x".into(), "y".into()],
            },
        ];

        let encoded = encode_task_for_create("ops", &task).expect("encode");
        assert!(encoded.contains(r#"Quote \" and\nnewline"#));
        assert!(encoded.contains(r#"tab\there"#));

        let parsed: Value = serde_json::from_str(&encoded).expect("valid json");
        let issue = &parsed["issue"];
        assert_eq!(issue["project_id"], json!("ops"));
        assert_eq!(issue["tracker_id"], json!(2));
        assert_eq!(
            issue["custom_fields"],
            json!([{"id": 10, "value": "high"}, {"id": 11, "value": ["x", "y"]}])
        );
        let keys: Vec<_> = issue.as_object().expect("object").keys().cloned().collect();
        assert_eq!(keys.len(), 5, "unexpected keys {keys:?}");
        assert!(issue.get("status_id").is_none());
        assert!(issue.get("is_private").is_none());
    }

    #[test]
    fn numeric_project_ids_are_sent_as_numbers() {
        let encoded = encode_task_for_create(" 12 ", &Task::new("s")).expect("encode");
        let parsed: Value = serde_json::from_str(&encoded).expect("valid json");
        assert_eq!(parsed["issue"]["project_id"], json!(12));
    }

    #[test]
    fn update_payload_carries_notes_but_no_project() {
        let mut task = Task::new("Subject");
        task.id = 9;
        task.project = Some(SimpleEntity::new(1, "P"));
        task.status = Some(SimpleEntity::new(3, "Resolved"));
        task.notes = Some("done\n\"really\"".into());

        let parsed: Value =
            serde_json::from_str(&encode_task_for_update(&task).expect("encode")).expect("json");
        assert!(parsed["issue"].get("project_id").is_none());
        assert_eq!(parsed["issue"]["status_id"], json!(3));
        assert_eq!(parsed["issue"]["notes"], json!("done\n\"really\""));
    }

    #[test]
    fn wiki_payload_keeps_text_and_lock_version() {
        let page = WikiPageDto {
            title: "Home".into(),
            text: Some("h1. Title\n\n\"quoted\"".into()),
            version: Some(4),
            comments: Some("edit".into()),
            ..WikiPageDto::default()
        };
        let upload = Upload {
            token: "7.abc".into(),
            filename: "a.png".into(),
            content_type: Some("image/png".into()),
            description: None,
        };
        let parsed: Value =
            serde_json::from_str(&encode_wiki_page(&page, &[upload]).expect("encode"))
                .expect("json");
        let wiki = &parsed["wiki_page"];
        assert_eq!(wiki["text"], json!("h1. Title\n\n\"quoted\""));
        assert_eq!(wiki["version"], json!(4));
        assert_eq!(wiki["uploads"][0]["token"], json!("7.abc"));
        assert!(wiki.get("parent_title").is_none());
    }

    #[test]
    fn time_entry_payload_prefers_issue_over_project() {
        let entry = TimeEntry {
            issue_id: Some(5),
            project: Some(SimpleEntity::new(1, "P")),
            activity: Some(SimpleEntity::new(9, "Dev")),
            hours: 1.5,
            spent_on: Some("2026-03-01".into()),
            ..TimeEntry::default()
        };
        let parsed: Value =
            serde_json::from_str(&encode_time_entry(&entry).expect("encode")).expect("json");
        assert_eq!(
            parsed,
            json!({"time_entry": {"issue_id": 5, "spent_on": "2026-03-01", "hours": 1.5, "activity_id": 9}})
        );
    }

    #[test]
    fn decodes_issue_custom_field_definitions_only() {
        let raw = json!({"custom_fields": [
            {
                "id": 1, "name": "Severity", "customized_type": "issue", "field_format": "list",
                "is_required": true,
                "possible_values": [{"value": "low", "label": "low"}, {"value": "high", "label": "high"}],
                "trackers": [{"id": 1, "name": "Bug"}, {"id": 2, "name": "Feature"}]
            },
            {"id": 2, "name": "Phone", "customized_type": "user", "field_format": "string"},
            {"id": 3, "name": "Free", "possible_values": ["a", ""], "default_value": null}
        ]})
        .to_string();

        let defs = decode_custom_field_definitions(&raw);
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].field_format, "list");
        assert!(defs[0].is_required);
        assert_eq!(defs[0].possible_values, vec!["low", "high"]);
        assert_eq!(defs[0].tracker_ids, vec![1, 2]);
        assert_eq!(defs[1].field_format, FORMAT_STRING);
        assert_eq!(defs[1].possible_values, vec!["a"]);
        assert_eq!(defs[1].default_value, None);
    }

    #[test]
    fn decodes_auxiliary_payloads() {
        assert_eq!(
            decode_upload_token(r#"{"upload":{"id":1,"token":"1.deadbeef"}}"#).as_deref(),
            Some("1.deadbeef")
        );
        assert_eq!(decode_upload_token(r#"{"upload":{}}"#), None);
        assert_eq!(
            decode_error_messages(r#"{"errors":["Subject cannot be blank","Status is invalid"]}"#),
            vec!["Subject cannot be blank", "Status is invalid"]
        );

        let user = decode_current_user(
            r#"{"user":{"id":4,"login":"jdoe","firstname":"Jane","lastname":"Doe"}}"#,
        )
        .expect("user");
        assert_eq!(user.name, "Jane Doe");
        let login_only = decode_current_user(r#"{"user":{"id":4,"login":"jdoe"}}"#).expect("user");
        assert_eq!(login_only.name, "jdoe");

        let members = decode_membership_page(
            r#"{"memberships":[{"id":1,"user":{"id":3,"name":"A"}},{"id":2,"group":{"id":9,"name":"G"}}],"total_count":2}"#,
        );
        assert_eq!(members.items, vec![SimpleEntity::new(3, "A")]);
        assert_eq!(members.received, 2);

        let trackers = decode_project_trackers(
            r#"{"project":{"id":1,"name":"P","trackers":[{"id":1,"name":"Bug"}]}}"#,
        );
        assert_eq!(trackers, vec![SimpleEntity::new(1, "Bug")]);
        assert!(decode_project_trackers(r#"{"project":{"id":1,"name":"P"}}"#).is_empty());
    }

    #[test]
    fn decodes_wiki_index_without_untitled_pages() {
        let pages = decode_wiki_index(
            r#"{"wiki_pages":[{"title":"Home","version":3},{"title":"Child","parent":{"title":"Home"}},{"version":1}]}"#,
        );
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].version, Some(3));
        assert_eq!(pages[1].parent_title.as_deref(), Some("Home"));
    }
}
