use std::path::Path;

use crate::error::{PipelineError, Result};

/// Values substituted into a native specification template.
#[derive(Debug, Clone)]
pub struct SpecParams<'a> {
    pub threads: u32,
    pub status_log: &'a str,
    pub restart_count: u32,
}

/// Substitute `$name` / `${name}` placeholders. `$$` is a literal `$`.
/// Unknown names and dangling `$` are errors.
pub fn render_native_spec(template: &str, params: &SpecParams<'_>) -> Result<String> {
    let lookup = |name: &str| -> Result<String> {
        match name {
            "numthreads" => Ok(params.threads.to_string()),
            "status_log_filename" => Ok(params.status_log.to_string()),
            "restart_count" => Ok(params.restart_count.to_string()),
            other => Err(PipelineError::Template(other.to_string())),
        }
    };

    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('$') => {
                chars.next();
                out.push('$');
            }
            Some('{') => {
                chars.next();
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => name.push(ch),
                        None => return Err(PipelineError::Template(format!("{{{}", name))),
                    }
                }
                out.push_str(&lookup(&name)?);
            }
            Some(ch) if ch.is_ascii_alphabetic() || *ch == '_' => {
                let mut name = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' {
                        name.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&lookup(&name)?);
            }
            _ => return Err(PipelineError::Template(String::new())),
        }
    }
    Ok(out)
}

/// Single-quote an argument for bash unless it is made only of safe characters.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

/// Render a self-contained Grid Engine submission script.
///
/// `prefix` is the instrumentation prefix, already shell-ready; `args` is
/// the job's own command and is quoted here.
pub fn render_script(
    job_name: &str,
    log_path: &Path,
    exports: &[String],
    prefix: &[String],
    args: &[String],
) -> String {
    let mut script = String::new();
    script.push_str("#!/bin/bash\n");
    script.push_str(&format!("#$ -N {}\n", job_name));
    script.push_str(&format!("#$ -o {}\n", log_path.display()));
    script.push_str("#$ -j y\n");
    script.push_str("hostname\nulimit -a\n");
    for export in exports {
        script.push_str(&format!("export {}\n", export));
    }

    let command: Vec<String> = prefix
        .iter()
        .cloned()
        .chain(args.iter().map(|a| shell_quote(a)))
        .collect();
    script.push_str(&command.join(" "));
    script.push('\n');
    script
}

/// Write `contents` to `path` and make it executable.
pub async fn write_script(path: &Path, contents: &str) -> std::io::Result<()> {
    tokio::fs::write(path, contents).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o775)).await?;
    }
    Ok(())
}
