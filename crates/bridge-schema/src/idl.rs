//! Parser for protobuf-style interface definition text.
//!
//! Only service declarations are interpreted. Messages, enums and extensions
//! are skipped by brace matching since payloads stay opaque to the bridge.

use crate::descriptor::{qualify_type, Cardinality, MethodDescriptor, ServiceDef};
use crate::error::SchemaError;

#[derive(Clone, Debug, PartialEq)]
enum Tok {
    Word(String),
    Str,
    Punct(char),
}

#[derive(Clone, Debug)]
struct Token {
    tok: Tok,
    line: usize,
}

fn describe(tok: &Tok) -> String {
    match tok {
        Tok::Word(w) => format!("'{w}'"),
        Tok::Str => "string literal".to_string(),
        Tok::Punct(c) => format!("'{c}'"),
    }
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_full_ident(s: &str) -> bool {
    let s = s.strip_prefix('.').unwrap_or(s);
    !s.is_empty() && s.split('.').all(is_ident)
}

fn tokenize(text: &str) -> Result<Vec<Token>, SchemaError> {
    let mut out = Vec::new();
    let mut chars = text.chars().peekable();
    let mut line = 1;

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                line += 1;
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '/' => {
                chars.next();
                match chars.peek() {
                    Some('/') => {
                        while chars.peek().is_some_and(|c| *c != '\n') {
                            chars.next();
                        }
                    }
                    Some('*') => {
                        let start = line;
                        chars.next();
                        let mut prev = '\0';
                        let mut closed = false;
                        for c in chars.by_ref() {
                            if c == '\n' {
                                line += 1;
                            }
                            if prev == '*' && c == '/' {
                                closed = true;
                                break;
                            }
                            prev = c;
                        }
                        if !closed {
                            return Err(SchemaError::syntax(start, "unterminated block comment"));
                        }
                    }
                    _ => return Err(SchemaError::syntax(line, "unexpected '/'")),
                }
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            chars.next();
                        }
                        '\n' => return Err(SchemaError::syntax(line, "newline in string literal")),
                        c if c == quote => {
                            closed = true;
                            break;
                        }
                        _ => {}
                    }
                }
                if !closed {
                    return Err(SchemaError::syntax(line, "unterminated string literal"));
                }
                out.push(Token { tok: Tok::Str, line });
            }
            c if is_word_char(c) => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if !is_word_char(c) {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                out.push(Token {
                    tok: Tok::Word(word),
                    line,
                });
            }
            '{' | '}' | '(' | ')' | '[' | ']' | '<' | '>' | ';' | '=' | ',' | ':' | '-' | '+' => {
                chars.next();
                out.push(Token {
                    tok: Tok::Punct(c),
                    line,
                });
            }
            other => {
                return Err(SchemaError::syntax(
                    line,
                    format!("unexpected character '{other}'"),
                ))
            }
        }
    }
    Ok(out)
}

struct RawMethod {
    name: String,
    client_streaming: bool,
    server_streaming: bool,
    request: String,
    response: String,
}

struct RawService {
    name: String,
    methods: Vec<RawMethod>,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|t| &t.tok)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(1, |t| t.line)
    }

    fn next(&mut self) -> Result<Token, SchemaError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| SchemaError::syntax(self.line(), "unexpected end of input"))?;
        self.pos += 1;
        Ok(token)
    }

    fn eat_punct(&mut self, c: char) -> bool {
        if self.peek() == Some(&Tok::Punct(c)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, c: char) -> Result<(), SchemaError> {
        let t = self.next()?;
        if t.tok == Tok::Punct(c) {
            Ok(())
        } else {
            Err(SchemaError::syntax(
                t.line,
                format!("expected '{c}', found {}", describe(&t.tok)),
            ))
        }
    }

    fn expect_str(&mut self) -> Result<(), SchemaError> {
        let t = self.next()?;
        match t.tok {
            Tok::Str => Ok(()),
            other => Err(SchemaError::syntax(
                t.line,
                format!("expected string literal, found {}", describe(&other)),
            )),
        }
    }

    fn expect_word(&mut self, what: &str) -> Result<(String, usize), SchemaError> {
        let t = self.next()?;
        match t.tok {
            Tok::Word(w) => Ok((w, t.line)),
            other => Err(SchemaError::syntax(
                t.line,
                format!("expected {what}, found {}", describe(&other)),
            )),
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String, SchemaError> {
        let (w, line) = self.expect_word(what)?;
        if !is_ident(&w) {
            return Err(SchemaError::syntax(line, format!("invalid {what} '{w}'")));
        }
        Ok(w)
    }

    fn expect_full_ident(&mut self, what: &str) -> Result<String, SchemaError> {
        let (w, line) = self.expect_word(what)?;
        if !is_full_ident(&w) {
            return Err(SchemaError::syntax(line, format!("invalid {what} '{w}'")));
        }
        Ok(w)
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<(), SchemaError> {
        let t = self.next()?;
        match &t.tok {
            Tok::Word(w) if w == kw => Ok(()),
            other => Err(SchemaError::syntax(
                t.line,
                format!("expected '{kw}', found {}", describe(other)),
            )),
        }
    }

    /// Consume through the next `;` outside braces (option values may be
    /// aggregate literals).
    fn skip_statement(&mut self) -> Result<(), SchemaError> {
        let mut depth = 0usize;
        loop {
            match self.next()?.tok {
                Tok::Punct('{') => depth += 1,
                Tok::Punct('}') => depth = depth.saturating_sub(1),
                Tok::Punct(';') if depth == 0 => return Ok(()),
                _ => {}
            }
        }
    }

    fn skip_block(&mut self) -> Result<(), SchemaError> {
        let start = self.line();
        self.expect_punct('{')?;
        let mut depth = 1usize;
        while depth > 0 {
            let t = self.next().map_err(|_| SchemaError::syntax(start, "unterminated block"))?;
            match t.tok {
                Tok::Punct('{') => depth += 1,
                Tok::Punct('}') => depth -= 1,
                _ => {}
            }
        }
        Ok(())
    }

    fn parse_service(&mut self) -> Result<RawService, SchemaError> {
        let name = self.expect_ident("service name")?;
        self.expect_punct('{')?;
        let mut methods = Vec::new();
        loop {
            let t = self.next()?;
            match &t.tok {
                Tok::Word(w) if w == "rpc" => methods.push(self.parse_rpc()?),
                Tok::Word(w) if w == "option" => self.skip_statement()?,
                Tok::Punct(';') => {}
                Tok::Punct('}') => break,
                other => {
                    return Err(SchemaError::syntax(
                        t.line,
                        format!("unexpected {} in service {name}", describe(other)),
                    ))
                }
            }
        }
        Ok(RawService { name, methods })
    }

    fn parse_rpc(&mut self) -> Result<RawMethod, SchemaError> {
        let name = self.expect_ident("method name")?;
        self.expect_punct('(')?;
        let (client_streaming, request) = self.parse_rpc_type()?;
        self.expect_punct(')')?;
        self.expect_keyword("returns")?;
        self.expect_punct('(')?;
        let (server_streaming, response) = self.parse_rpc_type()?;
        self.expect_punct(')')?;

        if !self.eat_punct(';') {
            if self.peek() == Some(&Tok::Punct('{')) {
                self.skip_block()?;
                self.eat_punct(';');
            } else {
                let t = self.next()?;
                return Err(SchemaError::syntax(
                    t.line,
                    format!("expected ';' or '{{' after rpc {name}, found {}", describe(&t.tok)),
                ));
            }
        }

        Ok(RawMethod {
            name,
            client_streaming,
            server_streaming,
            request,
            response,
        })
    }

    fn parse_rpc_type(&mut self) -> Result<(bool, String), SchemaError> {
        // `stream` is only a modifier when another name follows it.
        let is_stream = matches!(self.peek(), Some(Tok::Word(w)) if w == "stream")
            && matches!(self.tokens.get(self.pos + 1).map(|t| &t.tok), Some(Tok::Word(_)));
        if is_stream {
            self.pos += 1;
        }
        let ty = self.expect_full_ident("type name")?;
        Ok((is_stream, ty))
    }
}

pub(crate) fn parse(text: &str) -> Result<Vec<ServiceDef>, SchemaError> {
    let mut p = Parser::new(tokenize(text)?);
    let mut package: Option<String> = None;
    let mut services = Vec::new();

    while let Some(tok) = p.peek().cloned() {
        let line = p.line();
        match tok {
            Tok::Punct(';') => p.pos += 1,
            Tok::Word(w) => {
                p.pos += 1;
                match w.as_str() {
                    "syntax" | "edition" => {
                        p.expect_punct('=')?;
                        p.expect_str()?;
                        p.expect_punct(';')?;
                    }
                    "package" => {
                        if package.is_some() {
                            return Err(SchemaError::syntax(line, "duplicate package declaration"));
                        }
                        package = Some(p.expect_full_ident("package name")?);
                        p.expect_punct(';')?;
                    }
                    "import" => {
                        if matches!(p.peek(), Some(Tok::Word(m)) if m == "public" || m == "weak") {
                            p.pos += 1;
                        }
                        p.expect_str()?;
                        p.expect_punct(';')?;
                    }
                    "option" => p.skip_statement()?,
                    "message" | "enum" | "extend" => {
                        p.expect_full_ident(&format!("{w} name"))?;
                        p.skip_block()?;
                    }
                    "service" => services.push(p.parse_service()?),
                    other => {
                        return Err(SchemaError::syntax(line, format!("unexpected '{other}'")))
                    }
                }
            }
            other => {
                return Err(SchemaError::syntax(
                    line,
                    format!("unexpected {}", describe(&other)),
                ))
            }
        }
    }

    let package = package.unwrap_or_default();
    Ok(services
        .into_iter()
        .map(|svc| {
            let name = if package.is_empty() {
                svc.name
            } else {
                format!("{package}.{}", svc.name)
            };
            let methods = svc
                .methods
                .into_iter()
                .map(|m| MethodDescriptor {
                    service: name.clone(),
                    method: m.name,
                    cardinality: Cardinality::from_flags(m.client_streaming, m.server_streaming),
                    request_type: qualify_type(&package, &m.request),
                    response_type: qualify_type(&package, &m.response),
                })
                .collect();
            ServiceDef { name, methods }
        })
        .collect())
}
