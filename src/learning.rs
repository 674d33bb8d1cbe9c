use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::model::{CustomFieldDefinition, Task, FORMAT_DATE, FORMAT_STRING};

static DATE_PATTERN: OnceLock<Regex> = OnceLock::new();

fn date_pattern() -> &'static Regex {
    DATE_PATTERN
        .get_or_init(|| Regex::new(r"^[0-9]{4}-[0-9]{2}-[0-9]{2}$").expect("date pattern is valid"))
}

type Definitions = Arc<Mutex<Vec<CustomFieldDefinition>>>;

/// Custom-field schema learned from the tasks a tracker instance returns.
///
/// Each instance key (see [`instance_key_for`]) has its own definition list,
/// lock and file under `dir`. Learning only ever adds information.
#[derive(Debug)]
pub struct CustomFieldLearner {
    dir: PathBuf,
    instances: Mutex<HashMap<String, Definitions>>,
}

impl CustomFieldLearner {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_path(&self, instance_key: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(instance_key.as_bytes()));
        self.dir.join(format!("custom_fields_{}.json", &digest[..16]))
    }

    fn slot(&self, instance_key: &str) -> Definitions {
        let mut instances = self.instances.lock().expect("learner map mutex poisoned");
        if let Some(slot) = instances.get(instance_key) {
            return Arc::clone(slot);
        }
        let slot = Arc::new(Mutex::new(self.read_file(instance_key)));
        instances.insert(instance_key.to_string(), Arc::clone(&slot));
        slot
    }

    fn read_file(&self, instance_key: &str) -> Vec<CustomFieldDefinition> {
        let path = self.file_path(instance_key);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cannot read learned custom fields");
                return Vec::new();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(definitions) => definitions,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ignoring corrupt learned custom fields");
                Vec::new()
            }
        }
    }

    pub fn load(&self, instance_key: &str) -> usize {
        let loaded = self.read_file(instance_key);
        let count = loaded.len();
        let mut instances = self.instances.lock().expect("learner map mutex poisoned");
        match instances.get(instance_key) {
            Some(slot) => *slot.lock().expect("definitions mutex poisoned") = loaded,
            None => {
                instances.insert(instance_key.to_string(), Arc::new(Mutex::new(loaded)));
            }
        }
        drop(instances);
        debug!(instance_key, count, "loaded learned custom fields");
        count
    }

    pub fn save(&self, instance_key: &str) -> bool {
        let slot = self.slot(instance_key);
        let definitions = slot.lock().expect("definitions mutex poisoned");
        let path = self.file_path(instance_key);
        match write_atomically(&path, &definitions) {
            Ok(()) => {
                debug!(
                    instance_key,
                    count = definitions.len(),
                    path = %path.display(),
                    "saved learned custom fields"
                );
                true
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to save learned custom fields");
                false
            }
        }
    }

    pub fn definitions(&self, instance_key: &str) -> Vec<CustomFieldDefinition> {
        self.slot(instance_key)
            .lock()
            .expect("definitions mutex poisoned")
            .clone()
    }

    pub fn learn_from_tasks(&self, instance_key: &str, tasks: &[Task]) -> usize {
        let slot = self.slot(instance_key);
        let mut definitions = slot.lock().expect("definitions mutex poisoned");
        let mut changed = Vec::new();
        let mut seen = Vec::new();

        for task in tasks {
            for field in &task.custom_fields {
                if !seen.contains(&field.id) {
                    seen.push(field.id);
                }
                let index = match definitions.iter().position(|d| d.id == field.id) {
                    Some(index) => index,
                    None => {
                        definitions.push(CustomFieldDefinition::new(field.id, field.name.clone()));
                        changed.push(field.id);
                        definitions.len() - 1
                    }
                };
                let definition = &mut definitions[index];
                let mut grew = false;
                if definition.name.is_empty() && !field.name.is_empty() {
                    definition.name = field.name.clone();
                    grew = true;
                }
                if field.multiple && !definition.multiple {
                    definition.multiple = true;
                    grew = true;
                }
                if let Some(tracker_id) = task.tracker_id() {
                    grew |= definition.add_tracker(tracker_id);
                }
                if let Some(project_id) = task.project_id() {
                    grew |= definition.add_project(project_id);
                }
                for value in field.non_blank_values() {
                    grew |= definition.add_possible_value(value);
                }
                if grew && !changed.contains(&field.id) {
                    changed.push(field.id);
                }
            }
        }

        for definition in definitions.iter_mut().filter(|d| seen.contains(&d.id)) {
            if infer_date_format(definition) && !changed.contains(&definition.id) {
                changed.push(definition.id);
            }
        }

        if !changed.is_empty() {
            debug!(instance_key, changed = changed.len(), "learned custom fields from tasks");
        }
        changed.len()
    }

    pub fn merge_definitions(&self, instance_key: &str, declared: &[CustomFieldDefinition]) {
        let slot = self.slot(instance_key);
        let mut definitions = slot.lock().expect("definitions mutex poisoned");

        for incoming in declared {
            let Some(existing) = definitions.iter_mut().find(|d| d.id == incoming.id) else {
                definitions.push(incoming.clone());
                continue;
            };
            if !incoming.name.is_empty() {
                existing.name = incoming.name.clone();
            }
            if incoming.field_format != FORMAT_STRING || existing.field_format.is_empty() {
                existing.field_format = incoming.field_format.clone();
            }
            existing.is_required |= incoming.is_required;
            existing.multiple |= incoming.multiple;
            if incoming.default_value.is_some() {
                existing.default_value = incoming.default_value.clone();
            }
            for value in &incoming.possible_values {
                existing.add_possible_value(value);
            }
            for tracker_id in &incoming.tracker_ids {
                existing.add_tracker(*tracker_id);
            }
            for project_id in &incoming.project_ids {
                existing.add_project(*project_id);
            }
        }
    }
}

fn infer_date_format(definition: &mut CustomFieldDefinition) -> bool {
    if definition.field_format != FORMAT_STRING || definition.possible_values.is_empty() {
        return false;
    }
    let pattern = date_pattern();
    if definition.possible_values.iter().all(|v| pattern.is_match(v)) {
        definition.field_format = FORMAT_DATE.to_string();
        return true;
    }
    false
}

fn write_atomically(path: &Path, definitions: &[CustomFieldDefinition]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(definitions).map_err(io::Error::other)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)
}

pub fn instance_key_for(server_url: &str) -> String {
    server_url.trim().trim_end_matches('/').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;
    use crate::model::{CustomField, SimpleEntity};

    fn temp_dir(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "redmine-access-learning-{name}-{}-{nanos}",
            std::process::id()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    fn task(project: i64, tracker: i64, fields: Vec<CustomField>) -> Task {
        let mut task = Task::new("t");
        task.project = Some(SimpleEntity::new(project, "P"));
        task.tracker = Some(SimpleEntity::new(tracker, "T"));
        task.custom_fields = fields;
        task
    }

    const KEY: &str = "https://redmine.example.com";

    #[test]
    fn learns_existence_associations_and_values() {
        let learner = CustomFieldLearner::new(temp_dir("learn"));
        let tasks = vec![
            task(1, 10, vec![CustomField::single(5, "Team", "Core")]),
            task(2, 10, vec![CustomField::single(5, "Team", "Core")]),
            task(
                1,
                11,
                vec![
                    CustomField::single(5, "Team", " "),
                    CustomField::single(6, "Ref", ""),
                ],
            ),
        ];

        assert_eq!(learner.learn_from_tasks(KEY, &tasks), 2);

        let defs = learner.definitions(KEY);
        let team = defs.iter().find(|d| d.id == 5).expect("team");
        assert_eq!(team.field_format, FORMAT_STRING);
        assert_eq!(team.possible_values, vec!["Core"]);
        assert_eq!(team.tracker_ids, vec![10, 11]);
        assert_eq!(team.project_ids, vec![1, 2]);

        let reference = defs.iter().find(|d| d.id == 6).expect("ref");
        assert!(reference.possible_values.is_empty());

        assert_eq!(learner.learn_from_tasks(KEY, &tasks), 0);
    }

    #[test]
    fn infers_dates_and_never_downgrades() {
        let learner = CustomFieldLearner::new(temp_dir("dates"));
        learner.learn_from_tasks(
            KEY,
            &[
                task(1, 1, vec![CustomField::single(7, "Due", "2026-01-31")]),
                task(1, 1, vec![CustomField::single(8, "Mixed", "2026-01-31")]),
                task(1, 1, vec![CustomField::single(8, "Mixed", "soon")]),
            ],
        );
        let defs = learner.definitions(KEY);
        assert_eq!(defs.iter().find(|d| d.id == 7).expect("due").field_format, FORMAT_DATE);
        assert_eq!(defs.iter().find(|d| d.id == 8).expect("mixed").field_format, FORMAT_STRING);

        learner.learn_from_tasks(KEY, &[task(1, 1, vec![CustomField::single(7, "Due", "later")])]);
        let due = learner
            .definitions(KEY)
            .into_iter()
            .find(|d| d.id == 7)
            .expect("due");
        assert_eq!(due.field_format, FORMAT_DATE);
        assert_eq!(due.possible_values, vec!["2026-01-31", "later"]);
    }

    #[test]
    fn instances_do_not_mix() {
        let learner = CustomFieldLearner::new(temp_dir("mix"));
        let a = [task(1, 1, vec![CustomField::single(1, "A", "x")])];
        let b = [task(1, 1, vec![CustomField::single(2, "B", "y")])];
        learner.learn_from_tasks("https://a.example", &a);
        learner.learn_from_tasks("https://b.example", &b);

        assert_eq!(learner.definitions("https://a.example").len(), 1);
        assert_eq!(learner.definitions("https://a.example")[0].id, 1);
        assert_eq!(learner.definitions("https://b.example")[0].id, 2);
        assert_ne!(
            learner.file_path("https://a.example"),
            learner.file_path("https://b.example")
        );
    }

    #[test]
    fn saved_definitions_reload_in_a_new_learner() {
        let dir = temp_dir("persist");
        let learner = CustomFieldLearner::new(&dir);
        learner.learn_from_tasks(KEY, &[task(3, 4, vec![CustomField::single(9, "Area", "UI")])]);
        assert!(learner.save(KEY));

        let name = learner
            .file_path(KEY)
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .expect("file name");
        assert!(name.starts_with("custom_fields_") && name.ends_with(".json"));
        assert_eq!(name.len(), "custom_fields_".len() + 16 + ".json".len());

        let fresh = CustomFieldLearner::new(&dir);
        let defs = fresh.definitions(KEY);
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].possible_values, vec!["UI"]);
        assert_eq!(defs[0].project_ids, vec![3]);
        assert_eq!(fresh.load(KEY), 1);
    }

    #[test]
    fn only_ascii_digits_look_like_dates() {
        let learner = CustomFieldLearner::new(temp_dir("unicode-digits"));
        learner.learn_from_tasks(
            KEY,
            &[task(1, 1, vec![CustomField::single(4, "Devanagari", "२०२६-०१-३१")])],
        );
        let defs = learner.definitions(KEY);
        assert_eq!(defs[0].field_format, FORMAT_STRING);
    }

    #[test]
    fn load_replaces_memory_with_the_file_each_time() {
        let dir = temp_dir("reload");
        let writer = CustomFieldLearner::new(&dir);
        let reader = CustomFieldLearner::new(&dir);
        assert_eq!(reader.load(KEY), 0);

        writer.learn_from_tasks(KEY, &[task(1, 1, vec![CustomField::single(1, "A", "x")])]);
        assert!(writer.save(KEY));
        assert_eq!(reader.load(KEY), 1);

        writer.learn_from_tasks(KEY, &[task(1, 1, vec![CustomField::single(2, "B", "y")])]);
        assert!(writer.save(KEY));
        assert_eq!(reader.load(KEY), 2);
        assert_eq!(reader.definitions(KEY).len(), 2);
    }

    #[test]
    fn corrupt_file_degrades_to_empty() {
        let learner = CustomFieldLearner::new(temp_dir("corrupt"));
        fs::write(learner.file_path(KEY), "{ not json").expect("write");

        assert_eq!(learner.load(KEY), 0);
        assert!(learner.definitions(KEY).is_empty());
    }

    #[test]
    fn declared_definitions_merge_additively() {
        let learner = CustomFieldLearner::new(temp_dir("merge"));
        learner.learn_from_tasks(KEY, &[task(1, 2, vec![CustomField::single(4, "Level", "High")])]);

        let mut declared = CustomFieldDefinition::new(4, "Level");
        declared.field_format = "list".into();
        declared.is_required = true;
        declared.possible_values = vec!["Low".into(), "High".into()];
        declared.tracker_ids = vec![2, 3];
        let other = CustomFieldDefinition::new(12, "Other");
        learner.merge_definitions(KEY, &[declared, other]);

        let defs = learner.definitions(KEY);
        assert_eq!(defs.len(), 2);
        let level = &defs[0];
        assert_eq!(level.field_format, "list");
        assert!(level.is_required);
        assert_eq!(level.possible_values, vec!["High", "Low"]);
        assert_eq!(level.tracker_ids, vec![2, 3]);
        assert_eq!(level.project_ids, vec![1]);
    }

    #[test]
    fn concurrent_learning_keeps_every_value() {
        let learner = Arc::new(CustomFieldLearner::new(temp_dir("concurrent")));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let learner = Arc::clone(&learner);
                thread::spawn(move || {
                    for i in 0..25 {
                        let value = format!("v{t}-{i}");
                        let seen = [task(1, 1, vec![CustomField::single(1, "F", value)])];
                        learner.learn_from_tasks(KEY, &seen);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("learner thread");
        }
        assert_eq!(learner.definitions(KEY)[0].possible_values.len(), 100);
    }

    #[test]
    fn instance_key_ignores_case_and_trailing_slash() {
        assert_eq!(
            instance_key_for(" https://Redmine.Example.com/ "),
            "https://redmine.example.com"
        );
    }
}
