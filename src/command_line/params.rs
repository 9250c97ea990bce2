//! Ordered program parameters with a quote-aware string form.
//!
//! Parameters are stored verbatim. Conversion to and from a single display
//! string follows one rule set: a parameter is wrapped in double quotes when
//! it is empty or contains whitespace or a quote, and inside a wrapped
//! parameter both `"` and `\` are backslash-escaped. `parse` inverts `join`
//! for every parameter list, so the two can round-trip command lines through
//! text fields and config files.

/// Growable list of program parameters, preserving order and duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParametersList {
    parameters: Vec<String>,
}

impl ParametersList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, parameter: impl Into<String>) {
        self.parameters.push(parameter.into());
    }

    pub fn add_all<I, S>(&mut self, parameters: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for p in parameters {
            self.add(p);
        }
    }

    pub fn list(&self) -> &[String] {
        &self.parameters
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn clear(&mut self) {
        self.parameters.clear();
    }

    /// Render this list as a single space-separated string.
    pub fn join(&self) -> String {
        Self::join_args(&self.parameters)
    }

    /// Render any parameter slice as a single space-separated string.
    pub fn join_args(parameters: &[String]) -> String {
        let mut out = String::new();
        for param in parameters {
            if !out.is_empty() {
                out.push(' ');
            }
            append_quoted(&mut out, param);
        }
        out
    }

    /// Split a display string produced by [`ParametersList::join_args`] back
    /// into parameters. Whitespace separates parameters and double quotes
    /// group them. Inside a quoted region a backslash escapes a following
    /// `"` or `\`; outside quotes every backslash is literal, which keeps
    /// Windows paths readable without doubling every separator.
    pub fn parse(text: &str) -> Vec<String> {
        let mut result = Vec::new();
        let mut current = String::new();
        let mut in_quotes = false;
        let mut has_token = false;

        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '\\' if in_quotes => {
                    has_token = true;
                    match chars.peek() {
                        Some('"') | Some('\\') => {
                            current.push(chars.next().unwrap_or('\\'));
                        }
                        _ => current.push('\\'),
                    }
                }
                '"' => {
                    in_quotes = !in_quotes;
                    has_token = true;
                }
                c if c.is_whitespace() && !in_quotes => {
                    if has_token {
                        result.push(std::mem::take(&mut current));
                        has_token = false;
                    }
                }
                c => {
                    current.push(c);
                    has_token = true;
                }
            }
        }
        if has_token {
            result.push(current);
        }
        result
    }
}

fn needs_quoting(parameter: &str) -> bool {
    parameter.is_empty() || parameter.chars().any(|c| c.is_whitespace() || c == '"')
}

fn append_quoted(out: &mut String, parameter: &str) {
    if !needs_quoting(parameter) {
        out.push_str(parameter);
        return;
    }
    out.push('"');
    for c in parameter.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
}
