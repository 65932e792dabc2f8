//! C8: the in-memory hook table. Hooks are grouped by the file they were
//! loaded from, so a hot-reload of one file can atomically replace just
//! that file's hooks without disturbing the rest. A derived `id -> path`
//! index gives O(1) dispatch lookups.

use crate::error::DuplicateIdError;
use crate::hook::Hook;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Default)]
pub struct Registry {
    by_file: DashMap<PathBuf, Vec<Arc<Hook>>>,
    by_id: DashMap<String, (PathBuf, Arc<Hook>)>,
}

impl Registry {
    pub fn new() -> Self {
        Registry { by_file: DashMap::new(), by_id: DashMap::new() }
    }

    /// Replaces every hook previously loaded from `path` with `hooks`.
    /// Rejects the whole batch (leaving prior state untouched) if any id
    /// collides with a hook registered from a *different* file.
    pub fn replace_file(&self, path: &Path, hooks: Vec<Hook>) -> Result<(), DuplicateIdError> {
        for hook in &hooks {
            if let Some(existing) = self.by_id.get(&hook.id) {
                if existing.0 != path {
                    return Err(DuplicateIdError { id: hook.id.clone(), existing_path: existing.0.clone() });
                }
            }
        }

        self.remove_file(path);
        let mut registered = Vec::with_capacity(hooks.len());
        for hook in hooks {
            let hook = Arc::new(hook);
            self.by_id.insert(hook.id.clone(), (path.to_path_buf(), hook.clone()));
            registered.push(hook);
        }
        self.by_file.insert(path.to_path_buf(), registered);
        Ok(())
    }

    /// Removes every hook that came from `path`, e.g. on file deletion.
    pub fn remove_file(&self, path: &Path) {
        if let Some((_, hooks)) = self.by_file.remove(path) {
            for hook in hooks {
                self.by_id.remove(&hook.id);
            }
        }
    }

    pub fn match_by_id(&self, id: &str) -> Option<Arc<Hook>> {
        self.by_id.get(id).map(|entry| entry.1.clone())
    }

    /// A point-in-time copy of every registered hook, for `/health`,
    /// `-list-cookbooks`-style introspection, and hot-reload diffing.
    pub fn snapshot(&self) -> Vec<Arc<Hook>> {
        self.by_id.iter().map(|entry| entry.value().1.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hook(id: &str) -> Hook {
        Hook {
            id: id.to_string(),
            source_file: PathBuf::new(),
            execute_command: "/bin/true".into(),
            command_working_directory: None,
            response_message: String::new(),
            response_headers: Vec::new(),
            success_http_response_code: 200,
            http_methods: Vec::new(),
            include_command_output_in_response: false,
            include_command_output_in_response_on_error: false,
            parse_parameters_as_json: Vec::new(),
            pass_arguments_to_command: Vec::new(),
            pass_environment_to_command: Vec::new(),
            trigger_rule: None,
            trigger_rule_mismatch_http_response_code: 200,
            incoming_payload_content_type: None,
            stream_command_stdout_to_response: false,
        }
    }

    #[test]
    fn registers_and_looks_up_by_id() {
        let reg = Registry::new();
        reg.replace_file(Path::new("/a.json"), vec![hook("x")]).unwrap();
        assert!(reg.match_by_id("x").is_some());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn replacing_a_file_drops_its_old_hooks() {
        let reg = Registry::new();
        reg.replace_file(Path::new("/a.json"), vec![hook("x"), hook("y")]).unwrap();
        reg.replace_file(Path::new("/a.json"), vec![hook("z")]).unwrap();
        assert!(reg.match_by_id("x").is_none());
        assert!(reg.match_by_id("y").is_none());
        assert!(reg.match_by_id("z").is_some());
    }

    #[test]
    fn rejects_id_collision_across_files() {
        let reg = Registry::new();
        reg.replace_file(Path::new("/a.json"), vec![hook("x")]).unwrap();
        let result = reg.replace_file(Path::new("/b.json"), vec![hook("x")]);
        assert!(result.is_err());
        assert!(reg.match_by_id("x").is_some());
    }

    #[test]
    fn remove_file_clears_its_hooks() {
        let reg = Registry::new();
        reg.replace_file(Path::new("/a.json"), vec![hook("x")]).unwrap();
        reg.remove_file(Path::new("/a.json"));
        assert!(reg.is_empty());
    }
}
