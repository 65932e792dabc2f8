//! C4: reads a hook document off disk, optionally renders it as a
//! handlebars template, deserializes it (YAML or JSON, by extension),
//! validates it, and compiles it into `hook::Hook`s.

use crate::error::LoadError;
use crate::hook::{Hook, HookDoc, HookDocList, MatchKind, RuleDoc};
use crate::rule::Rule;
use handlebars::Handlebars;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Whether a hook document is rendered as a handlebars template before
/// being parsed. Literal documents (the common case) skip templating
/// entirely, so a config with no `{{ }}` syntax never pays for it and
/// never has its braces misinterpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentMode {
    Literal,
    Template,
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref(),
        Some("yaml") | Some("yml")
    )
}

/// Renders `{{ envvar.NAME }}` / `{{ getenv "NAME" }}` against the
/// process environment. Hooks that reference secrets this way keep them
/// out of the document on disk.
fn render_template(path: &Path, raw: &str) -> Result<String, LoadError> {
    let mut hb = Handlebars::new();
    hb.set_strict_mode(false);
    hb.register_helper(
        "getenv",
        Box::new(
            |h: &handlebars::Helper,
             _: &Handlebars,
             _: &handlebars::Context,
             _: &mut handlebars::RenderContext,
             out: &mut dyn handlebars::Output|
             -> handlebars::HelperResult {
                let name = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
                out.write(&std::env::var(name).unwrap_or_default())?;
                Ok(())
            },
        ),
    );
    let envvar: HashMap<String, String> = std::env::vars().collect();
    let data = serde_json::json!({ "envvar": envvar });
    hb.render_template(raw, &data).map_err(|e| LoadError::Template {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn deserialize_docs(path: &Path, text: &str) -> Result<HookDocList, LoadError> {
    if is_yaml(path) {
        serde_yaml::from_str(text).map_err(|source| LoadError::Yaml { path: path.to_path_buf(), source })
    } else {
        serde_json::from_str(text).map_err(|source| LoadError::Json { path: path.to_path_buf(), source })
    }
}

fn validate_doc(path: &Path, index: usize, doc: &HookDoc) -> Result<(), LoadError> {
    let fail = |message: &str| -> LoadError {
        LoadError::Validation { path: path.to_path_buf(), index, id: doc.id.clone(), message: message.to_string() }
    };
    if doc.id.trim().is_empty() {
        return Err(fail("hook id must not be empty"));
    }
    if doc.execute_command.trim().is_empty() {
        return Err(fail("execute-command must not be empty"));
    }
    if let Some(rule) = &doc.trigger_rule {
        validate_rule_doc(rule).map_err(|m| fail(&m))?;
    }
    Ok(())
}

fn validate_rule_doc(rule: &RuleDoc) -> Result<(), String> {
    match rule {
        RuleDoc::And { and } | RuleDoc::Or { or: and } => and.iter().try_for_each(validate_rule_doc),
        RuleDoc::Not { not } => validate_rule_doc(not),
        RuleDoc::Match { match_ } => {
            if matches!(match_.kind, MatchKind::Value) && match_.parameter.is_none() {
                return Err("a value match requires a parameter".to_string());
            }
            if matches!(match_.kind, MatchKind::Value) && match_.value.is_none() {
                return Err("a value match requires a value".to_string());
            }
            Ok(())
        }
    }
}

/// Loads and compiles every hook in a single file. Duplicate ids within
/// the same file are rejected; duplicates across files are the
/// registry's concern (spec §4.C8), not the loader's.
pub async fn load_file(path: &Path, mode: DocumentMode) -> Result<Vec<Hook>, LoadError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| LoadError::Io { path: path.to_path_buf(), source })?;

    let text = match mode {
        DocumentMode::Literal => raw,
        DocumentMode::Template => render_template(path, &raw)?,
    };

    let docs = deserialize_docs(path, &text)?;

    let mut seen_ids = std::collections::HashSet::new();
    let mut hooks = Vec::with_capacity(docs.len());
    for (index, doc) in docs.into_iter().enumerate() {
        validate_doc_at(path, index, &doc)?;
        if !seen_ids.insert(doc.id.clone()) {
            return Err(LoadError::DuplicateInFile { path: path.to_path_buf(), id: doc.id });
        }
        hooks.push(compile_doc_at(path, index, doc)?);
    }
    Ok(hooks)
}

fn validate_doc_at(path: &Path, index: usize, doc: &HookDoc) -> Result<(), LoadError> {
    validate_doc(path, index, doc)
}

fn compile_doc_at(path: &Path, index: usize, doc: HookDoc) -> Result<Hook, LoadError> {
    let id = doc.id.clone();
    let trigger_rule = match &doc.trigger_rule {
        Some(rd) => Some(Rule::compile(rd).map_err(|message| LoadError::Validation {
            path: path.to_path_buf(),
            index,
            id: id.clone(),
            message,
        })?),
        None => None,
    };
    Ok(Hook {
        id: doc.id,
        source_file: path.to_path_buf(),
        execute_command: doc.execute_command,
        command_working_directory: doc.command_working_directory,
        response_message: doc.response_message,
        response_headers: doc.response_headers,
        success_http_response_code: doc.success_http_response_code,
        http_methods: doc.http_methods,
        include_command_output_in_response: doc.include_command_output_in_response,
        include_command_output_in_response_on_error: doc.include_command_output_in_response_on_error,
        parse_parameters_as_json: doc.parse_parameters_as_json,
        pass_arguments_to_command: doc.pass_arguments_to_command,
        pass_environment_to_command: doc.pass_environment_to_command,
        trigger_rule,
        trigger_rule_mismatch_http_response_code: doc.trigger_rule_mismatch_http_response_code,
        incoming_payload_content_type: doc.incoming_payload_content_type,
        stream_command_stdout_to_response: doc.stream_command_stdout_to_response,
    })
}

/// Loads every `*.json`/`*.yaml`/`*.yml` file directly under `dir`
/// (non-recursive, matching the original tool's flat hooks directory
/// convention), skipping files that don't parse as hook documents and
/// logging them instead of aborting startup.
pub async fn load_directory(dir: &Path, mode: DocumentMode) -> Result<HashMap<PathBuf, Vec<Hook>>, LoadError> {
    let mut out = HashMap::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|source| LoadError::Io { path: dir.to_path_buf(), source })?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|source| LoadError::Io { path: dir.to_path_buf(), source })?
    {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let is_hook_doc = matches!(
            path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref(),
            Some("json") | Some("yaml") | Some("yml")
        );
        if !is_hook_doc {
            continue;
        }
        match load_file(&path, mode).await {
            Ok(hooks) => {
                out.insert(path, hooks);
            }
            Err(e) => log::error!("skipping unloadable hook file {}: {e}", path.display()),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp(name: &str, content: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join(name)).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        dir
    }

    #[tokio::test]
    async fn loads_a_literal_json_hook() {
        let dir = write_tmp(
            "hooks.json",
            r#"[{"id":"deploy","execute-command":"/bin/true"}]"#,
        );
        let hooks = load_file(&dir.path().join("hooks.json"), DocumentMode::Literal).await.unwrap();
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks[0].id, "deploy");
    }

    #[tokio::test]
    async fn rejects_duplicate_ids_in_one_file() {
        let dir = write_tmp(
            "hooks.json",
            r#"[
                {"id":"deploy","execute-command":"/bin/true"},
                {"id":"deploy","execute-command":"/bin/false"}
            ]"#,
        );
        let result = load_file(&dir.path().join("hooks.json"), DocumentMode::Literal).await;
        assert!(matches!(result, Err(LoadError::DuplicateInFile { .. })));
    }

    #[tokio::test]
    async fn rejects_value_match_without_parameter() {
        let dir = write_tmp(
            "hooks.json",
            r#"[{"id":"x","execute-command":"/bin/true","trigger-rule":{"match":{"type":"value","value":"1"}}}]"#,
        );
        let result = load_file(&dir.path().join("hooks.json"), DocumentMode::Literal).await;
        assert!(matches!(result, Err(LoadError::Validation { .. })));
    }

    #[tokio::test]
    async fn renders_envvar_template_before_parsing() {
        std::env::set_var("HOOKD_TEST_SECRET", "s3cr3t");
        let dir = write_tmp(
            "hooks.json",
            r#"[{"id":"deploy","execute-command":"/bin/true","trigger-rule":{"match":{"type":"value","parameter":{"source":"header","name":"x"},"value":"{{envvar.HOOKD_TEST_SECRET}}"}}}]"#,
        );
        let hooks = load_file(&dir.path().join("hooks.json"), DocumentMode::Template).await.unwrap();
        assert_eq!(hooks.len(), 1);
    }

    #[tokio::test]
    async fn loads_a_yaml_hook() {
        let dir = write_tmp(
            "hooks.yaml",
            "- id: deploy\n  execute-command: /bin/true\n",
        );
        let hooks = load_file(&dir.path().join("hooks.yaml"), DocumentMode::Literal).await.unwrap();
        assert_eq!(hooks[0].id, "deploy");
    }
}
