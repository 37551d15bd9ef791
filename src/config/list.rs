use anyhow::Result;
use serde_json::{Map, Value};

use crate::args::BaseArgs;

type Fields = Vec<(&'static str, String)>;

pub fn run(base: BaseArgs, global: bool, local: bool, verbose: bool) -> Result<()> {
    if verbose {
        run_verbose(base, global, local)
    } else {
        run_resolved(base, global, local)
    }
}

fn masked(config: &super::Config) -> Fields {
    config
        .non_empty_fields()
        .into_iter()
        .map(|(k, v)| match k {
            "token" => (k, "********".to_string()),
            _ => (k, v),
        })
        .collect()
}

fn run_resolved(base: BaseArgs, global: bool, local: bool) -> Result<()> {
    let config = if global {
        super::load_global()?
    } else if local {
        super::local_path()
            .map(|p| super::load_file(&p))
            .unwrap_or_default()
    } else {
        super::load()?
    };

    let output = format_resolved(&masked(&config), base.json)?;
    if !output.is_empty() {
        if base.json {
            // JSON goes to stdout so it can be piped
            println!("{output}");
        } else {
            eprintln!("{output}");
        }
    }

    Ok(())
}

fn format_resolved(fields: &Fields, json: bool) -> Result<String> {
    if json {
        let map: Map<String, Value> = fields
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.clone())))
            .collect();
        Ok(serde_json::to_string(&map)?)
    } else {
        Ok(fields
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

fn run_verbose(base: BaseArgs, global: bool, local: bool) -> Result<()> {
    let mut sources: Vec<(String, Fields)> = Vec::new();

    if !local {
        if let Ok(path) = super::global_path() {
            let fields = masked(&super::load_file(&path));
            if !fields.is_empty() {
                sources.push((path.display().to_string(), fields));
            }
        }
    }

    if !global {
        if let Some(path) = super::local_path() {
            let display_path = std::env::current_dir()
                .ok()
                .and_then(|cwd| path.strip_prefix(&cwd).ok().map(|p| p.to_path_buf()))
                .unwrap_or_else(|| path.clone())
                .display()
                .to_string();
            let fields = masked(&super::load_file(&path));
            if !fields.is_empty() {
                sources.push((display_path, fields));
            }
        }
    }

    let output = format_verbose(&sources, base.json)?;
    if !output.is_empty() {
        println!("{output}");
    }

    Ok(())
}

fn format_verbose(sources: &[(String, Fields)], json: bool) -> Result<String> {
    if json {
        let mut map = Map::new();
        for (path, fields) in sources {
            let o: Map<String, Value> = fields
                .iter()
                .map(|(k, v)| (k.to_string(), Value::String(v.clone())))
                .collect();
            map.insert(path.clone(), Value::Object(o));
        }
        Ok(serde_json::to_string(&map)?)
    } else {
        let mut parts = Vec::new();
        for (path, fields) in sources {
            let mut group = String::from(path.as_str());
            for (key, value) in fields {
                group.push_str(&format!("\n  {key}: {value}"));
            }
            parts.push(group);
        }
        Ok(parts.join("\n\n"))
    }
}
