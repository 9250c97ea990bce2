//! Platform-specific quoting for command lines that leave the process.
//!
//! The builder stores parameters unescaped; this module renders them the way
//! the target shell or C runtime will re-read them. POSIX arguments get
//! single-quote wrapping, Windows arguments follow the MSVCRT backslash
//! rules, and arguments destined for `cmd.exe` scripts additionally get
//! their metacharacters caret-escaped.

/// Target conventions for rendering a command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Unix,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Unix
        }
    }
}

// Private-use sentinels bracketing a parameter that must be emitted inside
// plain double quotes, bypassing platform escaping entirely.
const INESCAPABLE_OPEN: char = '\u{E000}';
const INESCAPABLE_CLOSE: char = '\u{E001}';

/// Mark a parameter so [`to_command_line`] wraps it in plain double quotes
/// instead of applying platform escaping. For callers that know better than
/// the escaper, e.g. arguments a target program parses with its own rules.
pub fn inescapable_quote(parameter: &str) -> String {
    let mut out = String::with_capacity(parameter.len() + 2);
    out.push(INESCAPABLE_OPEN);
    out.push_str(parameter);
    out.push(INESCAPABLE_CLOSE);
    out
}

fn strip_inescapable(parameter: &str) -> Option<&str> {
    let inner = parameter.strip_prefix(INESCAPABLE_OPEN)?;
    inner.strip_suffix(INESCAPABLE_CLOSE)
}

/// Render an executable plus its parameters as the target platform's
/// shell-safe token list, one escaped token per element.
pub fn to_command_line(exe: &str, parameters: &[String], platform: Platform) -> Vec<String> {
    let cmd_script = platform == Platform::Windows && is_cmd_script(exe);
    let mut line = Vec::with_capacity(parameters.len() + 1);
    line.push(escape_parameter(exe, platform, cmd_script));
    for parameter in parameters {
        line.push(escape_parameter(parameter, platform, cmd_script));
    }
    line
}

fn escape_parameter(parameter: &str, platform: Platform, cmd_script: bool) -> String {
    if let Some(inner) = strip_inescapable(parameter) {
        return format!("\"{}\"", inner);
    }
    let escaped = match platform {
        Platform::Unix => escape_posix(parameter),
        Platform::Windows => escape_windows(parameter),
    };
    // Unquoted tokens reaching a .bat/.cmd interpreter go through cmd.exe
    // parsing a second time, so its metacharacters need neutralizing.
    if cmd_script && !escaped.starts_with('"') {
        escape_cmd_meta(&escaped)
    } else {
        escaped
    }
}

fn is_cmd_script(exe: &str) -> bool {
    let lower = exe.to_ascii_lowercase();
    lower.ends_with(".bat") || lower.ends_with(".cmd")
}

/// Quote one argument for a POSIX shell. Arguments made only of unreserved
/// characters pass through untouched; everything else is wrapped in single
/// quotes, with embedded single quotes spliced out as `'\''`.
pub fn escape_posix(argument: &str) -> String {
    fn safe(c: char) -> bool {
        c.is_ascii_alphanumeric() || matches!(c, '@' | '%' | '+' | '=' | ':' | ',' | '.' | '/' | '_' | '-')
    }

    if !argument.is_empty() && argument.chars().all(safe) {
        return argument.to_string();
    }
    let mut out = String::with_capacity(argument.len() + 2);
    out.push('\'');
    for c in argument.chars() {
        if c == '\'' {
            out.push_str(r"'\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// Quote one argument for the Windows C runtime (`CommandLineToArgvW`
/// semantics). Arguments without spaces, tabs or quotes pass through. Others
/// are wrapped in double quotes; N backslashes before an embedded quote
/// become 2N+1 backslashes, and N trailing backslashes become 2N so the
/// closing quote survives.
pub fn escape_windows(argument: &str) -> String {
    let needs = argument.is_empty()
        || argument.chars().any(|c| c == ' ' || c == '\t' || c == '"');
    if !needs {
        return argument.to_string();
    }

    let chars: Vec<char> = argument.chars().collect();
    let mut out = String::with_capacity(argument.len() + 2);
    out.push('"');
    let mut i = 0;
    while i < chars.len() {
        let mut backslashes = 0;
        while i < chars.len() && chars[i] == '\\' {
            backslashes += 1;
            i += 1;
        }
        if i == chars.len() {
            for _ in 0..backslashes * 2 {
                out.push('\\');
            }
        } else if chars[i] == '"' {
            for _ in 0..backslashes * 2 + 1 {
                out.push('\\');
            }
            out.push('"');
            i += 1;
        } else {
            for _ in 0..backslashes {
                out.push('\\');
            }
            out.push(chars[i]);
            i += 1;
        }
    }
    out.push('"');
    out
}

fn escape_cmd_meta(argument: &str) -> String {
    let mut out = String::with_capacity(argument.len());
    for c in argument.chars() {
        if matches!(c, '&' | '<' | '>' | '(' | ')' | '|' | '^') {
            out.push('^');
        }
        out.push(c);
    }
    out
}
