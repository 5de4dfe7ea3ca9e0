//! Directive grammar
//!
//! A small block-structured text format that maps one-to-one onto
//! [`AppConfig`]. Tokens are separated by whitespace, `"..."` quotes a token
//! that contains spaces, `#` at the start of a token comments out the rest of
//! the line, and a lone `{` / `}` opens or closes a block. Arguments belong to
//! the directive on the same line.

use crate::app::{validate_node_name, AppConfig, NodeConfig};
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Token {
    text: String,
    line: usize,
    quoted: bool,
}

impl Token {
    fn bare(text: &str, line: usize) -> Self {
        Self {
            text: text.to_string(),
            line,
            quoted: false,
        }
    }

    fn is_open(&self) -> bool {
        !self.quoted && self.text == "{"
    }

    fn is_close(&self) -> bool {
        !self.quoted && self.text == "}"
    }

    fn is_structural(&self) -> bool {
        self.is_open() || self.is_close()
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ConfigError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    let mut line = 1;

    while let Some(&c) = chars.peek() {
        if c == '\n' {
            line += 1;
            chars.next();
            continue;
        }
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '#' {
            while chars.peek().is_some_and(|&ch| ch != '\n') {
                chars.next();
            }
            continue;
        }

        if c == '"' {
            chars.next();
            let start = line;
            let mut text = String::new();
            loop {
                match chars.next() {
                    None => {
                        return Err(ConfigError::directive(start, "unterminated quoted string"))
                    }
                    Some('"') => break,
                    Some('\\') if chars.peek() == Some(&'"') => {
                        chars.next();
                        text.push('"');
                    }
                    Some('\n') => {
                        line += 1;
                        text.push('\n');
                    }
                    Some(ch) => text.push(ch),
                }
            }
            tokens.push(Token {
                text,
                line: start,
                quoted: true,
            });
            continue;
        }

        let mut text = String::new();
        while let Some(&ch) = chars.peek() {
            if ch.is_whitespace() {
                break;
            }
            text.push(ch);
            chars.next();
        }

        // `{}` is shorthand for an empty block
        if text == "{}" {
            tokens.push(Token::bare("{", line));
            tokens.push(Token::bare("}", line));
        } else {
            tokens.push(Token::bare(&text, line));
        }
    }

    Ok(tokens)
}

struct Dispenser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Dispenser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    /// Line of the most recently consumed token
    fn line(&self) -> usize {
        self.pos
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map_or(1, |t| t.line)
    }

    /// Consume the remaining non-structural tokens on `line`
    fn args(&mut self, line: usize) -> Vec<Token> {
        let mut args = Vec::new();
        while let Some(token) = self.peek() {
            if token.line != line || token.is_structural() {
                break;
            }
            args.extend(self.next());
        }
        args
    }

    /// Consume a `{` if it opens a block on `line`
    fn open_block(&mut self, line: usize) -> bool {
        match self.peek() {
            Some(token) if token.line == line && token.is_open() => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    fn eof_error(&self) -> ConfigError {
        ConfigError::directive(self.line(), "unexpected end of input, expected '}'")
    }
}

/// Parse a boolean literal.
///
/// Accepts `1 t T TRUE true True` and `0 f F FALSE false False`.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

fn single_arg(d: &mut Dispenser, directive: &Token) -> Result<String, ConfigError> {
    let mut args = d.args(directive.line);
    match args.len() {
        0 => Err(ConfigError::directive(
            directive.line,
            format!("missing argument for {}", directive.text),
        )),
        1 => Ok(args.remove(0).text),
        _ => Err(ConfigError::directive(
            directive.line,
            format!("too many arguments for {}", directive.text),
        )),
    }
}

/// Bare flag means `true`
fn optional_bool(d: &mut Dispenser, directive: &Token) -> Result<bool, ConfigError> {
    let args = d.args(directive.line);
    match args.as_slice() {
        [] => Ok(true),
        [value] => parse_bool(&value.text).ok_or_else(|| {
            ConfigError::directive(
                value.line,
                format!("invalid boolean {:?} for {}", value.text, directive.text),
            )
        }),
        _ => Err(ConfigError::directive(
            directive.line,
            format!("too many arguments for {}", directive.text),
        )),
    }
}

/// Bare `port` means 0
fn optional_port(d: &mut Dispenser, directive: &Token) -> Result<u16, ConfigError> {
    let args = d.args(directive.line);
    match args.as_slice() {
        [] => Ok(0),
        [value] => value.text.parse::<u16>().map_err(|_| {
            ConfigError::directive(value.line, format!("invalid port {:?}", value.text))
        }),
        _ => Err(ConfigError::directive(
            directive.line,
            "too many arguments for port",
        )),
    }
}

fn list_args(d: &mut Dispenser, directive: &Token) -> Result<Vec<String>, ConfigError> {
    let args = d.args(directive.line);
    if args.is_empty() {
        return Err(ConfigError::directive(
            directive.line,
            format!("missing argument for {}", directive.text),
        ));
    }
    Ok(args.into_iter().map(|t| t.text).collect())
}

/// Parse a complete configuration: an option name followed by an optional
/// block of app-level directives and node blocks.
pub fn parse_app(input: &str) -> Result<AppConfig, ConfigError> {
    let mut d = Dispenser::new(tokenize(input)?);
    let mut app = AppConfig::default();

    let option = d
        .next()
        .ok_or_else(|| ConfigError::directive(1, "expected option name"))?;
    if option.is_structural() {
        return Err(ConfigError::directive(
            option.line,
            format!("expected option name, found {:?}", option.text),
        ));
    }
    if let Some(extra) = d.args(option.line).first() {
        return Err(ConfigError::directive(
            extra.line,
            format!("unexpected argument {:?}", extra.text),
        ));
    }

    if d.open_block(option.line) {
        parse_app_block(&mut d, &mut app)?;
    }

    if let Some(extra) = d.peek() {
        return Err(ConfigError::directive(
            extra.line,
            format!("unexpected token {:?}", extra.text),
        ));
    }

    Ok(app)
}

fn parse_app_block(d: &mut Dispenser, app: &mut AppConfig) -> Result<(), ConfigError> {
    loop {
        let token = d.next().ok_or_else(|| d.eof_error())?;
        if token.is_close() {
            return Ok(());
        }
        if token.is_open() {
            return Err(ConfigError::directive(token.line, "unexpected '{'"));
        }

        match token.text.as_str() {
            "auth_key" => app.default_auth_key = single_arg(d, &token)?,
            "control_url" => app.control_url = single_arg(d, &token)?,
            "ephemeral" => app.ephemeral = optional_bool(d, &token)?,
            "webui" => app.webui = optional_bool(d, &token)?,
            "state_dir" => app.state_dir = single_arg(d, &token)?,
            "tags" => app.tags.extend(list_args(d, &token)?),
            _ => {
                let node = parse_node(d, &token)?;
                if app.nodes.contains_key(&token.text) {
                    return Err(ConfigError::directive(
                        token.line,
                        format!("duplicate node {:?}", token.text),
                    ));
                }
                app.nodes.insert(token.text, node);
            }
        }
    }
}

fn parse_node(d: &mut Dispenser, name: &Token) -> Result<NodeConfig, ConfigError> {
    validate_node_name(&name.text)
        .map_err(|e| ConfigError::directive(name.line, e.to_string()))?;

    if let Some(extra) = d.args(name.line).first() {
        return Err(ConfigError::directive(
            extra.line,
            format!("unexpected argument {:?} for node {}", extra.text, name.text),
        ));
    }

    let mut node = NodeConfig::default();
    if !d.open_block(name.line) {
        return Ok(node);
    }

    loop {
        let token = d.next().ok_or_else(|| d.eof_error())?;
        if token.is_close() {
            return Ok(node);
        }
        if token.is_open() {
            return Err(ConfigError::directive(token.line, "unexpected '{'"));
        }

        match token.text.as_str() {
            "auth_key" => node.auth_key = single_arg(d, &token)?,
            "control_url" => node.control_url = single_arg(d, &token)?,
            "ephemeral" => node.ephemeral = Some(optional_bool(d, &token)?),
            "webui" => node.webui = Some(optional_bool(d, &token)?),
            "hostname" => node.hostname = single_arg(d, &token)?,
            "port" => node.port = optional_port(d, &token)?,
            "state_dir" => node.state_dir = single_arg(d, &token)?,
            "tags" => node.tags.extend(list_args(d, &token)?),
            other => {
                return Err(ConfigError::directive(
                    token.line,
                    format!("unrecognized subdirective: {}", other),
                ))
            }
        }
    }
}
