// Specification error types
// Carries the violated rule, its location in the document and an optional hint

use std::fmt;

/// Failure to turn a pipeline document into a [`PipelineSpec`](super::PipelineSpec)
#[derive(Debug, Clone)]
pub struct SpecificationError {
    pub message: String,
    /// Line number (1-indexed), 0 when unknown
    pub line: usize,
    /// Column number (1-indexed), 0 when unknown
    pub column: usize,
    /// Excerpt of the document around the error
    pub context: String,
    pub suggestion: Option<String>,
    pub kind: SpecificationErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecificationErrorKind {
    /// The document is not well-formed YAML/JSON
    Syntax,
    /// The document violates a structural or cross-field rule
    Schema,
    /// The document could not be read
    Io,
}

impl SpecificationError {
    pub fn schema(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: 0,
            column: 0,
            context: String::new(),
            suggestion: None,
            kind: SpecificationErrorKind::Schema,
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self {
            kind: SpecificationErrorKind::Io,
            ..Self::schema(message)
        }
    }

    pub fn at(mut self, line: usize, column: usize) -> Self {
        self.line = line;
        self.column = column;
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Attach the lines around [`Self::line`] from `source`
    pub fn with_source_context(mut self, source: &str, context_lines: usize) -> Self {
        if self.line == 0 {
            return self;
        }

        let lines: Vec<&str> = source.lines().collect();
        let start = self.line.saturating_sub(context_lines + 1);
        let end = (self.line + context_lines).min(lines.len());

        let mut context = String::new();
        for (i, line) in lines.iter().enumerate().take(end).skip(start) {
            let line_num = i + 1;
            let marker = if line_num == self.line { ">" } else { " " };
            context.push_str(&format!("{} {:4} | {}\n", marker, line_num, line));

            if line_num == self.line && self.column > 0 {
                let caret = " ".repeat(self.column.saturating_sub(1)) + "^";
                context.push_str(&format!("       | {}\n", caret));
            }
        }

        self.context = context;
        self
    }

    /// Build from a serde_yaml failure, classifying syntax against schema problems
    pub fn from_yaml_error(err: &serde_yaml::Error, source: Option<&str>) -> Self {
        let kind = if is_syntax_error(&err.to_string()) {
            SpecificationErrorKind::Syntax
        } else {
            SpecificationErrorKind::Schema
        };
        Self::located(err, source, kind)
    }

    /// Build from a failure to load `source` as YAML at all
    pub fn from_yaml_syntax_error(err: &serde_yaml::Error, source: &str) -> Self {
        Self::located(err, Some(source), SpecificationErrorKind::Syntax)
    }

    fn located(
        err: &serde_yaml::Error,
        source: Option<&str>,
        kind: SpecificationErrorKind,
    ) -> Self {
        let mut error = Self {
            kind,
            ..Self::schema(clean_yaml_message(err))
        };

        if let Some(location) = err.location() {
            error = error.at(location.line(), location.column());
        }

        if let Some(source) = source {
            error = error.with_source_context(source, 2);
        }

        let suggestion = if error.message.contains("cannot start any token")
            && tab_near(source, error.line)
        {
            Some("YAML does not allow tabs for indentation, use spaces".to_string())
        } else {
            suggest_fix(&error.message)
        };

        match suggestion {
            Some(suggestion) => error.with_suggestion(suggestion),
            None => error,
        }
    }
}

impl fmt::Display for SpecificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "error: {}", self.message)?;
        if self.line > 0 {
            writeln!(f, "  --> line {}:{}", self.line, self.column)?;
        }

        if !self.context.is_empty() {
            writeln!(f)?;
            write!(f, "{}", self.context)?;
        }

        if let Some(suggestion) = &self.suggestion {
            writeln!(f)?;
            writeln!(f, "help: {}", suggestion)?;
        }

        Ok(())
    }
}

impl std::error::Error for SpecificationError {}

/// Result type for specification parsing
pub type SpecResult<T> = Result<T, SpecificationError>;

/// Semantic problem found by [`SpecValidator`](super::SpecValidator)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
    pub path: String,
    pub suggestion: Option<String>,
}

impl ValidationError {
    pub fn new(message: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: path.into(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "validation error at '{}': {}", self.path, self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " ({})", suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

// serde_yaml appends " at line X column Y" which we report separately
fn clean_yaml_message(err: &serde_yaml::Error) -> String {
    let msg = err.to_string();
    let msg = match msg.find(" at line ") {
        Some(idx) => msg[..idx].to_string(),
        None => msg,
    };

    if let Some(field) = between(&msg, "missing field `", "`") {
        return msg.replace(&format!("missing field `{}`", field), &format!("missing required field '{}'", field));
    }

    msg
}

fn is_syntax_error(message: &str) -> bool {
    const SYNTAX_MARKERS: [&str; 6] = [
        "did not find expected",
        "found character that cannot start",
        "mapping values are not allowed",
        "found unexpected end of stream",
        "while parsing",
        "while scanning",
    ];
    SYNTAX_MARKERS.iter().any(|marker| message.contains(marker))
}

/// Whether the reported line, or the one before it, holds a tab
fn tab_near(source: Option<&str>, line: usize) -> bool {
    let Some(source) = source else {
        return false;
    };
    if line == 0 {
        return source.contains('\t');
    }

    source
        .lines()
        .skip(line.saturating_sub(2))
        .take(2)
        .any(|l| l.contains('\t'))
}

fn between<'a>(msg: &'a str, prefix: &str, suffix: &str) -> Option<&'a str> {
    let start = msg.find(prefix)? + prefix.len();
    let end = msg[start..].find(suffix)? + start;
    Some(&msg[start..end])
}

fn suggest_fix(message: &str) -> Option<String> {
    if message.contains("missing required field 'script'") {
        return Some("every step needs a 'script:' list, even an empty one".to_string());
    }

    if message.contains("'variables' can only be the first element") {
        return Some("move the 'variables' block to the top of the pipeline".to_string());
    }

    if message.contains("oidc-role") {
        return Some("use 'access-key' and 'secret-key' instead".to_string());
    }

    if message.contains("unknown variant") && message.contains("2x") {
        return Some("supported step sizes are '1x' and '2x'".to_string());
    }

    None
}
