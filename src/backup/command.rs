use std::borrow::Cow;
use thiserror::Error;

use super::job::Job;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("no sources")]
    NoSources,
    #[error("no destination")]
    NoDestination,
}

/// Flags selected by `preserve`, in the order they are emitted.
pub const PRESERVE_FLAGS: [&str; 5] = ["-p", "-o", "-g", "-D", "-t"];

/// Machine-parsable progress mode understood by the runner's parser.
pub const PROGRESS_FLAG: &str = "--info=progress2";

/// Build the rsync argument list for a job.
///
/// Flag order is fixed so previews and logs are reproducible. Sources follow
/// the excludes in input order and the destination is always the last token.
pub fn build_args(job: &Job) -> Result<Vec<String>, ValidationError> {
    job.validate()?;

    let options = &job.options;
    let mut args: Vec<String> = Vec::new();

    if options.archive {
        args.push("-a".into());
    }
    if options.verbose {
        args.push("-v".into());
    }
    if options.compress {
        args.push("-z".into());
    }
    if options.preserve {
        args.extend(PRESERVE_FLAGS.iter().map(|f| f.to_string()));
    }
    if options.delete {
        args.push("--delete".into());
    }
    if options.dry_run {
        args.push("--dry-run".into());
    }
    if options.show_progress {
        args.push(PROGRESS_FLAG.into());
    }

    for pattern in &job.excludes {
        args.push("--exclude".into());
        args.push(pattern.clone());
    }

    args.extend(job.normalized_sources());
    args.push(job.destination.clone());

    Ok(args)
}

/// Human-readable command line for display. Never executed.
pub fn render_preview(program: &str, args: &[String]) -> String {
    let mut line = String::from(program);
    for arg in args {
        line.push(' ');
        line.push_str(&shell_quote(arg));
    }
    line
}

pub fn preview(program: &str, job: &Job) -> Result<String, ValidationError> {
    build_args(job).map(|args| render_preview(program, &args))
}

/// POSIX shell quoting: safe words stay bare, everything else is wrapped in
/// single quotes with embedded quotes spliced as `'"'"'`.
pub fn shell_quote(arg: &str) -> Cow<'_, str> {
    if arg.is_empty() {
        return Cow::Borrowed("''");
    }
    let safe = arg
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./_-".contains(c));
    if safe {
        Cow::Borrowed(arg)
    } else {
        Cow::Owned(format!("'{}'", arg.replace('\'', r#"'"'"'"#)))
    }
}
