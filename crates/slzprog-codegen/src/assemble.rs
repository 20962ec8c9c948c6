//! External assembler invocation: hands emitted NASM-syntax text to
//! a real assembler binary and reads back the machine code it produces.

use std::io::Write;
use std::path::Path;
use std::process::Command;

use tracing::warn;

use crate::CodegenError;

/// Assembles `source` (NASM syntax, flat binary `.text` body) into raw
/// machine code bytes by shelling out to `assembler_path` (a `nasm`
/// binary or compatible drop-in).
///
/// The source is written to a temporary file via the `tempfile` crate
/// rather than a fixed path, so concurrent builds in the same process
/// never collide. When `keep_intermediates` is set, the assembled `.bin`
/// is additionally copied next to `source_debug_path` for inspection.
pub fn assemble(
    source: &str,
    assembler_path: &str,
    keep_intermediates: bool,
    source_debug_path: Option<&Path>,
) -> Result<Vec<u8>, CodegenError> {
    let dir = tempfile::tempdir()?;
    let asm_path = dir.path().join("module.asm");
    let bin_path = dir.path().join("module.bin");

    {
        let mut f = std::fs::File::create(&asm_path)?;
        f.write_all(source.as_bytes())?;
    }

    let output = Command::new(assembler_path)
        .arg("-f")
        .arg("bin")
        .arg(&asm_path)
        .arg("-o")
        .arg(&bin_path)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        warn!(status = ?output.status, %stderr, "assembler invocation failed");
        return Err(CodegenError::AssemblerFailed {
            status: output.status.code().unwrap_or(-1),
            stderr,
        });
    }

    let bytes = std::fs::read(&bin_path)?;

    if keep_intermediates {
        if let Some(debug_path) = source_debug_path {
            std::fs::copy(&asm_path, debug_path.with_extension("asm")).ok();
            std::fs::copy(&bin_path, debug_path.with_extension("bin")).ok();
        }
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A fake "assembler" shell script: `cat` the input file to the output
    /// path. Exercises the tempfile plumbing and exit-status handling
    /// without depending on a real NASM binary being installed.
    #[test]
    fn assemble_reads_back_assembler_stdout_file() {
        let script_dir = tempfile::tempdir().unwrap();
        let script_path = script_dir.path().join("fake_nasm.sh");
        std::fs::write(
            &script_path,
            "#!/bin/sh\n# args: -f bin <in> -o <out>\ncp \"$3\" \"$5\"\n",
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&script_path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&script_path, perms).unwrap();
        }

        let result = assemble("db 0x90\n", script_path.to_str().unwrap(), false, None);
        assert!(result.is_ok());
        assert_eq!(result.unwrap(), b"db 0x90\n".to_vec());
    }

    #[test]
    fn assemble_reports_nonzero_exit_as_assembler_failed() {
        let script_dir = tempfile::tempdir().unwrap();
        let script_path = script_dir.path().join("fail_nasm.sh");
        std::fs::write(&script_path, "#!/bin/sh\necho 'bad syntax' >&2\nexit 1\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&script_path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&script_path, perms).unwrap();
        }

        let err = assemble("garbage", script_path.to_str().unwrap(), false, None).unwrap_err();
        match err {
            CodegenError::AssemblerFailed { status, stderr } => {
                assert_eq!(status, 1);
                assert!(stderr.contains("bad syntax"));
            }
            other => panic!("expected AssemblerFailed, got {other:?}"),
        }
    }
}
