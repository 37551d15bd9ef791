use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Load `.env` files before clap parses arguments, so `env = "STITCH_*"`
/// defaults can come from them. Returns the files that were read.
pub fn bootstrap_from_args(args: &[OsString]) -> Result<Vec<PathBuf>> {
    let cwd = std::env::current_dir().context("failed to read current directory")?;
    let explicit = extract_env_file_arg(args);
    let files = resolve_env_files(&cwd, explicit.as_deref());
    let values = read_env_files(&files, explicit.is_some())?;

    for (key, value) in values.vars {
        std::env::set_var(key, value);
    }
    Ok(values.loaded)
}

struct EnvValues {
    vars: BTreeMap<String, String>,
    loaded: Vec<PathBuf>,
}

/// Files are ordered lowest to highest precedence; later files override
/// earlier ones and the real environment overrides them all.
fn read_env_files(files: &[PathBuf], required: bool) -> Result<EnvValues> {
    let mut vars = BTreeMap::new();
    let mut loaded = Vec::new();
    for file in files {
        if !required && !file.exists() {
            continue;
        }
        let parsed = dotenvy::from_path_iter(file)
            .with_context(|| format!("failed to read env file {}", file.display()))?;
        for item in parsed {
            let (key, value) =
                item.with_context(|| format!("failed to parse env file {}", file.display()))?;
            if std::env::var_os(&key).is_none() {
                vars.insert(key, value);
            }
        }
        loaded.push(file.clone());
    }
    Ok(EnvValues { vars, loaded })
}

fn extract_env_file_arg(args: &[OsString]) -> Option<PathBuf> {
    let mut explicit = None;
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        let Some(arg) = arg.to_str() else {
            continue;
        };
        if arg == "--" {
            break;
        }
        if arg == "--env-file" {
            explicit = iter.next().map(PathBuf::from);
        } else if let Some(value) = arg.strip_prefix("--env-file=") {
            explicit = Some(PathBuf::from(value));
        }
    }
    explicit
}

fn resolve_env_files(cwd: &Path, explicit: Option<&Path>) -> Vec<PathBuf> {
    if let Some(path) = explicit {
        return vec![cwd.join(path)];
    }

    let stitch_env = std::env::var("STITCH_ENV").unwrap_or_else(|_| "development".to_string());
    let mut files = vec![cwd.join(".env"), cwd.join(format!(".env.{stitch_env}"))];
    if stitch_env != "test" {
        files.push(cwd.join(".env.local"));
    }
    files.push(cwd.join(format!(".env.{stitch_env}.local")));
    files
}
