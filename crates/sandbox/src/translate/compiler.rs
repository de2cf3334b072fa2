//! Compilation of generated source into a shared object with the system C compiler.

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

use super::{Error, Result, TranslationOptions};

/// A compiled shared object. The temporary build directory, if any, lives as long as this value.
pub(super) struct SharedObject {
    pub path: PathBuf,
    _directory: Option<TempDir>,
}

/// FNV-1a hash of the source, stable across runs and toolchains.
fn source_hash(source: &str, options: &TranslationOptions) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    let compiler = options.compiler().to_string_lossy().into_owned();
    let flags = options.flags.join(" ");
    for byte in [compiler.as_bytes(), flags.as_bytes(), source.as_bytes()]
        .into_iter()
        .flatten()
    {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

fn run_compiler(options: &TranslationOptions, source: &Path, output: &Path) -> Result<()> {
    let compiler = options.compiler();
    let result = Command::new(&compiler)
        .args(&options.flags)
        .args(["-shared", "-fPIC", "-o"])
        .arg(output)
        .arg(source)
        .output()
        .map_err(|err| Error::CompilerUnavailable {
            compiler: compiler.clone(),
            source: err,
        })?;

    if !result.status.success() {
        return Err(Error::CompilationFailed(
            String::from_utf8_lossy(&result.stderr).into_owned(),
        ));
    }

    Ok(())
}

/// Compile `source` into a shared object, reusing a cached object when a cache directory is
/// configured and holds one for the same source.
pub(super) fn compile(source: &str, options: &TranslationOptions) -> Result<SharedObject> {
    let hash = source_hash(source, options);
    let cached = options
        .cache_dir
        .as_ref()
        .map(|dir| dir.join(format!("rv-{hash:016x}.so")));

    if let Some(path) = cached.as_ref().filter(|path| path.is_file()) {
        tracing::debug!(path = %path.display(), "reusing cached translation");
        return Ok(SharedObject {
            path: path.clone(),
            _directory: None,
        });
    }

    let directory = tempfile::Builder::new().prefix("rv-translate").tempdir()?;
    let source_path = directory.path().join("blocks.c");
    let output_path = directory.path().join("blocks.so");
    std::fs::write(&source_path, source)?;
    run_compiler(options, &source_path, &output_path)?;

    match cached {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&output_path, &path)?;
            Ok(SharedObject {
                path,
                _directory: None,
            })
        }
        None => Ok(SharedObject {
            path: output_path,
            _directory: Some(directory),
        }),
    }
}
