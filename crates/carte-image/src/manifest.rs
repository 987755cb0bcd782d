//! Build manifest (`Cartefile`) parsing.
//!
//! One instruction per line; blank lines and `#` comments are skipped, a
//! trailing `\` joins the next line, and directives are case-insensitive.
//! `FROM` must come first and appear exactly once.

use std::fmt;
use std::path::Path;

use carte_common::error::{CarteError, Result};
use carte_common::types::ImageRef;

/// A single typed build directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Base image reference.
    From(ImageRef),
    /// Working directory for later steps and the container.
    Workdir(String),
    /// Copy from the build context into the image.
    Copy {
        /// Context-relative source.
        src: String,
        /// Destination, resolved against the working directory when relative.
        dst: String,
    },
    /// Shell command executed in the image root.
    Run(String),
    /// Environment variable for later steps and the container.
    Env {
        /// Variable name.
        key: String,
        /// Variable value.
        value: String,
    },
    /// Container entrypoint.
    Entrypoint(Vec<String>),
    /// Default command (arguments to the entrypoint when one is set).
    Cmd(Vec<String>),
    /// Documented ports.
    Expose(Vec<String>),
}

impl Instruction {
    /// Upper-case directive name.
    #[must_use]
    pub const fn keyword(&self) -> &'static str {
        match self {
            Self::From(_) => "FROM",
            Self::Workdir(_) => "WORKDIR",
            Self::Copy { .. } => "COPY",
            Self::Run(_) => "RUN",
            Self::Env { .. } => "ENV",
            Self::Entrypoint(_) => "ENTRYPOINT",
            Self::Cmd(_) => "CMD",
            Self::Expose(_) => "EXPOSE",
        }
    }

    /// True for directives that only change image metadata.
    #[must_use]
    pub const fn is_metadata(&self) -> bool {
        matches!(
            self,
            Self::Env { .. } | Self::Entrypoint(_) | Self::Cmd(_) | Self::Expose(_)
        )
    }
}

/// An instruction with its source position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// 1-based line number of the first physical line.
    pub line: usize,
    /// Normalized source text (continuations joined).
    pub text: String,
    /// Parsed instruction.
    pub instruction: Instruction,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.text)
    }
}

/// A parsed build manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Base image from the leading `FROM`.
    pub base: ImageRef,
    /// Every instruction after `FROM`, in order.
    pub steps: Vec<Step>,
}

impl Manifest {
    /// Reads and parses a manifest file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be read, or a validation
    /// error naming the offending line.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| CarteError::io(path, e))?;
        let manifest = parse(&content)?;
        tracing::debug!(path = %path.display(), steps = manifest.steps.len(), "manifest parsed");
        Ok(manifest)
    }
}

/// Parses manifest text.
///
/// # Errors
///
/// Returns a validation error for an empty manifest, a missing, late, or
/// repeated `FROM`, unknown directives, or malformed arguments.
pub fn parse(content: &str) -> Result<Manifest> {
    let mut base = None;
    let mut steps = Vec::new();

    for (line, text) in logical_lines(content) {
        let instruction = parse_line(line, &text)?;
        match instruction {
            Instruction::From(image) => {
                if base.is_some() {
                    return Err(line_error(line, "FROM may appear only once"));
                }
                if !steps.is_empty() {
                    return Err(line_error(line, "FROM must be the first instruction"));
                }
                base = Some(image);
            }
            instruction => {
                if base.is_none() {
                    return Err(line_error(line, "FROM must be the first instruction"));
                }
                steps.push(Step {
                    line,
                    text,
                    instruction,
                });
            }
        }
    }

    let base = base.ok_or_else(|| CarteError::validation("manifest has no FROM instruction"))?;
    Ok(Manifest { base, steps })
}

/// Joins continuation lines and drops blanks and comments.
fn logical_lines(content: &str) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    let mut pending: Option<(usize, String)> = None;

    for (idx, raw) in content.lines().enumerate() {
        let trimmed = raw.trim();
        if pending.is_none() && (trimmed.is_empty() || trimmed.starts_with('#')) {
            continue;
        }
        let (body, continues) = trimmed
            .strip_suffix('\\')
            .map_or((trimmed, false), |b| (b.trim_end(), true));
        let (start, mut text) = pending.take().unwrap_or((idx + 1, String::new()));
        if !text.is_empty() && !body.is_empty() {
            text.push(' ');
        }
        text.push_str(body);
        if continues {
            pending = Some((start, text));
        } else {
            out.push((start, text));
        }
    }
    if let Some(last) = pending {
        out.push(last);
    }
    out
}

fn parse_line(line: usize, text: &str) -> Result<Instruction> {
    let (directive, args) = text
        .split_once(char::is_whitespace)
        .map_or((text, ""), |(d, a)| (d, a.trim()));
    let keyword = directive.to_ascii_uppercase();
    if args.is_empty() {
        return Err(line_error(line, &format!("{keyword} requires an argument")));
    }

    match keyword.as_str() {
        "FROM" => {
            let image = args.split_whitespace().next().unwrap_or(args);
            ImageRef::parse(image)
                .map(Instruction::From)
                .map_err(|e| line_error(line, &e.to_string()))
        }
        "WORKDIR" => Ok(Instruction::Workdir(args.to_string())),
        "COPY" => {
            let parts: Vec<&str> = args.split_whitespace().collect();
            match parts.as_slice() {
                [src, dst] => Ok(Instruction::Copy {
                    src: (*src).to_string(),
                    dst: (*dst).to_string(),
                }),
                _ => Err(line_error(line, "COPY expects exactly <src> <dst>")),
            }
        }
        "RUN" => Ok(Instruction::Run(args.to_string())),
        "ENV" => parse_env(line, args),
        "ENTRYPOINT" => parse_command(line, args).map(Instruction::Entrypoint),
        "CMD" => parse_command(line, args).map(Instruction::Cmd),
        "EXPOSE" => parse_ports(line, args).map(Instruction::Expose),
        other => Err(line_error(line, &format!("unknown instruction {other}"))),
    }
}

fn parse_env(line: usize, args: &str) -> Result<Instruction> {
    let (key, value) = match args.split_once('=') {
        Some((key, value)) if !key.contains(char::is_whitespace) => (key, value),
        _ => args
            .split_once(char::is_whitespace)
            .map(|(k, v)| (k, v.trim()))
            .ok_or_else(|| line_error(line, "ENV expects KEY=VALUE or KEY VALUE"))?,
    };
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(line_error(line, &format!("invalid ENV key '{key}'")));
    }
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);
    Ok(Instruction::Env {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Exec form (`["a", "b"]`) or whitespace-separated words.
fn parse_command(line: usize, args: &str) -> Result<Vec<String>> {
    if args.starts_with('[') {
        let words: Vec<String> = serde_json::from_str(args)
            .map_err(|e| line_error(line, &format!("invalid exec form: {e}")))?;
        if words.is_empty() {
            return Err(line_error(line, "exec form must not be empty"));
        }
        return Ok(words);
    }
    Ok(args.split_whitespace().map(str::to_string).collect())
}

fn parse_ports(line: usize, args: &str) -> Result<Vec<String>> {
    args.split_whitespace()
        .map(|spec| {
            let (port, proto) = spec.split_once('/').unwrap_or((spec, "tcp"));
            let valid_port = port.parse::<u16>().is_ok_and(|p| p > 0);
            if valid_port && matches!(proto, "tcp" | "udp") {
                Ok(spec.to_string())
            } else {
                Err(line_error(line, &format!("invalid port '{spec}'")))
            }
        })
        .collect()
}

fn line_error(line: usize, message: &str) -> CarteError {
    CarteError::validation(format!("line {line}: {message}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_directive() {
        let manifest = parse(
            "# comment\n\
             FROM base\n\
             WORKDIR /app\n\
             COPY src /app/src\n\
             RUN echo hi\n\
             ENV X=1\n\
             ENTRYPOINT [\"/bin/sh\", \"-c\"]\n\
             CMD echo ok\n\
             EXPOSE 80 53/udp\n",
        )
        .unwrap();

        assert_eq!(manifest.base, ImageRef::new("base", "latest"));
        let kinds: Vec<_> = manifest.steps.iter().map(|s| s.instruction.keyword()).collect();
        assert_eq!(
            kinds,
            ["WORKDIR", "COPY", "RUN", "ENV", "ENTRYPOINT", "CMD", "EXPOSE"]
        );
        assert_eq!(manifest.steps[0].line, 3);
        assert_eq!(
            manifest.steps[4].instruction,
            Instruction::Entrypoint(vec!["/bin/sh".into(), "-c".into()])
        );
        assert_eq!(
            manifest.steps[6].instruction,
            Instruction::Expose(vec!["80".into(), "53/udp".into()])
        );
    }

    #[test]
    fn directives_are_case_insensitive() {
        let manifest = parse("from base:v1\nrun true\n").unwrap();
        assert_eq!(manifest.base.tag, "v1");
        assert_eq!(manifest.steps[0].instruction, Instruction::Run("true".into()));
    }

    #[test]
    fn continuation_lines_are_joined() {
        let manifest = parse("FROM base\nRUN apt-get update && \\\n    apt-get install -y curl\n").unwrap();
        assert_eq!(
            manifest.steps[0].instruction,
            Instruction::Run("apt-get update && apt-get install -y curl".into())
        );
        assert_eq!(manifest.steps[0].line, 2);
    }

    #[test]
    fn env_accepts_both_forms() {
        let manifest = parse("FROM base\nENV A=1\nENV B two words\nENV C=\"q\"\n").unwrap();
        let envs: Vec<_> = manifest
            .steps
            .iter()
            .map(|s| match &s.instruction {
                Instruction::Env { key, value } => format!("{key}={value}"),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(envs, ["A=1", "B=two words", "C=q"]);
    }

    #[test]
    fn missing_from_is_rejected() {
        let err = parse("RUN echo hi\n").unwrap_err();
        assert!(err.to_string().contains("FROM must be the first"));
        assert!(parse("# only a comment\n").unwrap_err().is_validation());
    }

    #[test]
    fn repeated_from_is_rejected() {
        let err = parse("FROM a\nRUN x\nFROM b\n").unwrap_err();
        assert!(err.to_string().contains("line 3"));
    }

    #[test]
    fn unknown_directive_names_line() {
        let err = parse("FROM base\nVOLUME /data\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
        assert!(err.to_string().contains("VOLUME"));
    }

    #[test]
    fn malformed_arguments_are_rejected() {
        assert!(parse("FROM base\nCOPY onlyone\n").is_err());
        assert!(parse("FROM base\nRUN\n").is_err());
        assert!(parse("FROM base\nEXPOSE http\n").is_err());
        assert!(parse("FROM base\nCMD [\"unterminated\n").is_err());
    }
}
