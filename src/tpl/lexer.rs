use crate::Result;
use crate::error::TplError;
use std::fmt;

/// 1-based line/column of a character in the template source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    /// Literal text outside of any delimiter.
    Text,
    /// `{{`
    ExprOpen,
    /// `}}`
    ExprClose,
    /// `{%`
    TagOpen,
    /// `%}`
    TagClose,
    Ident,
    /// Quoted string; `value` holds the unescaped content.
    Str,
    Number,
    /// `|`
    Pipe,
    /// `:`
    Colon,
    /// `,`
    Comma,
    /// `.`
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    /// Comparison, arithmetic and symbolic logical operators.
    Operator,
    /// `=`
    Assign,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TokenKind::Text => "text",
            TokenKind::ExprOpen => "`{{`",
            TokenKind::ExprClose => "`}}`",
            TokenKind::TagOpen => "`{%`",
            TokenKind::TagClose => "`%}`",
            TokenKind::Ident => "identifier",
            TokenKind::Str => "string",
            TokenKind::Number => "number",
            TokenKind::Pipe => "`|`",
            TokenKind::Colon => "`:`",
            TokenKind::Comma => "`,`",
            TokenKind::Dot => "`.`",
            TokenKind::LBracket => "`[`",
            TokenKind::RBracket => "`]`",
            TokenKind::LParen => "`(`",
            TokenKind::RParen => "`)`",
            TokenKind::Operator => "operator",
            TokenKind::Assign => "`=`",
        };
        f.write_str(s)
    }
}

/// One lexical unit, tagged with the position of its first character.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub value: String,
    pub line: usize,
    pub column: usize,
}

impl Token {
    pub fn pos(&self) -> Position {
        Position::new(self.line, self.column)
    }

    /// True if the token has `kind` and, when given, exactly `value`.
    pub fn is(&self, kind: TokenKind, value: Option<&str>) -> bool {
        self.kind == kind && value.is_none_or(|v| self.value == v)
    }
}

const EXPR_OPEN: &str = "{{";
const EXPR_CLOSE: &str = "}}";
const TAG_OPEN: &str = "{%";
const TAG_CLOSE: &str = "%}";
const COMMENT_OPEN: &str = "{#";
const COMMENT_CLOSE: &str = "#}";

/// Hand-written scanner for the template language.
///
/// Outside delimiters everything is literal text. Inside `{{ }}` and `{% %}` it
/// produces identifiers, literals, operators and punctuation. `{# #}` comments
/// are dropped entirely.
struct Lexer<'a> {
    src: &'a str,
    /// Byte offset into `src`.
    pos: usize,
    line: usize,
    column: usize,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            pos: 0,
            line: 1,
            column: 1,
            tokens: Vec::new(),
        }
    }

    fn tokenize(mut self) -> Result<Vec<Token>> {
        while self.pos < self.src.len() {
            let rest = self.rest();
            if rest.starts_with(EXPR_OPEN) {
                self.lex_block(TokenKind::ExprOpen, EXPR_OPEN, TokenKind::ExprClose, EXPR_CLOSE)?;
            } else if rest.starts_with(TAG_OPEN) {
                self.lex_block(TokenKind::TagOpen, TAG_OPEN, TokenKind::TagClose, TAG_CLOSE)?;
            } else if rest.starts_with(COMMENT_OPEN) {
                self.skip_comment();
            } else {
                self.lex_text();
            }
        }
        Ok(self.tokens)
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn here(&self) -> Position {
        Position::new(self.line, self.column)
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        self.rest().chars().nth(1)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn bump_str(&mut self, s: &str) {
        for _ in s.chars() {
            self.bump();
        }
    }

    fn push(&mut self, kind: TokenKind, value: impl Into<String>, at: Position) {
        self.tokens.push(Token {
            kind,
            value: value.into(),
            line: at.line,
            column: at.column,
        });
    }

    /// Consume text up to the next delimiter opener.
    fn lex_text(&mut self) {
        let rest = self.rest();
        let end = [EXPR_OPEN, TAG_OPEN, COMMENT_OPEN]
            .iter()
            .filter_map(|d| rest.find(d))
            .min()
            .unwrap_or(rest.len());
        let text = &rest[..end];
        let at = self.here();
        self.bump_str(text);
        self.push(TokenKind::Text, text, at);
    }

    /// An unterminated `{#` is literal text.
    fn skip_comment(&mut self) {
        let at = self.here();
        match self.rest().find(COMMENT_CLOSE) {
            Some(end) => {
                let comment = &self.rest()[..end + COMMENT_CLOSE.len()];
                self.bump_str(comment);
            }
            None => {
                self.bump_str(COMMENT_OPEN);
                self.push(TokenKind::Text, COMMENT_OPEN, at);
            }
        }
    }

    fn lex_block(
        &mut self,
        open_kind: TokenKind,
        open: &str,
        close_kind: TokenKind,
        close: &str,
    ) -> Result<()> {
        let opened_at = self.here();
        self.bump_str(open);
        self.push(open_kind, open, opened_at);

        loop {
            while self.peek().is_some_and(char::is_whitespace) {
                self.bump();
            }
            if self.pos >= self.src.len() {
                return Err(TplError::lex(format!("unterminated `{}` block", open), opened_at));
            }
            if self.rest().starts_with(close) {
                let at = self.here();
                self.bump_str(close);
                self.push(close_kind, close, at);
                return Ok(());
            }
            self.lex_token()?;
        }
    }

    fn lex_token(&mut self) -> Result<()> {
        let at = self.here();
        let Some(c) = self.peek() else {
            return Ok(());
        };

        if c.is_alphabetic() || c == '_' {
            let start = self.pos;
            while self.peek().is_some_and(|c| c.is_alphanumeric() || c == '_') {
                self.bump();
            }
            let ident = &self.src[start..self.pos];
            self.push(TokenKind::Ident, ident, at);
            return Ok(());
        }

        if c.is_ascii_digit() {
            return self.lex_number(at);
        }

        if c == '"' || c == '\'' {
            return self.lex_string(c, at);
        }

        if let Some(second) = self.peek_second() {
            let pair: String = [c, second].iter().collect();
            if matches!(pair.as_str(), "==" | "!=" | "<=" | ">=" | "&&" | "||") {
                self.bump_str(&pair);
                self.push(TokenKind::Operator, pair, at);
                return Ok(());
            }
        }

        let kind = match c {
            '|' => TokenKind::Pipe,
            ':' => TokenKind::Colon,
            ',' => TokenKind::Comma,
            '.' => TokenKind::Dot,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '=' => TokenKind::Assign,
            '+' | '-' | '*' | '/' | '%' | '<' | '>' | '!' => TokenKind::Operator,
            other => {
                return Err(TplError::lex(
                    format!("unexpected character `{}`", other),
                    at,
                ));
            }
        };
        self.bump();
        self.push(kind, c.to_string(), at);
        Ok(())
    }

    fn lex_number(&mut self, at: Position) -> Result<()> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
        }

        // After a `.` the number is a path index (`items.0.name`), never a fraction.
        let after_dot = self
            .tokens
            .last()
            .is_some_and(|t| t.kind == TokenKind::Dot);
        if !after_dot
            && self.peek() == Some('.')
            && self.peek_second().is_some_and(|c| c.is_ascii_digit())
        {
            self.bump();
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.bump();
            }
        }

        let number = &self.src[start..self.pos];
        self.push(TokenKind::Number, number, at);
        Ok(())
    }

    fn lex_string(&mut self, quote: char, at: Position) -> Result<()> {
        self.bump();
        let mut value = String::new();
        loop {
            let Some(c) = self.bump() else {
                return Err(TplError::lex("unterminated string literal", at));
            };
            match c {
                '\\' => {
                    let escape_at = self.here();
                    let escaped = match self.bump() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('r') => '\r',
                        Some('0') => '\0',
                        Some('\\') => '\\',
                        Some('"') => '"',
                        Some('\'') => '\'',
                        Some(other) => {
                            return Err(TplError::lex(
                                format!("malformed string literal: unknown escape `\\{}`", other),
                                escape_at,
                            ));
                        }
                        None => return Err(TplError::lex("unterminated string literal", at)),
                    };
                    value.push(escaped);
                }
                c if c == quote => break,
                c => value.push(c),
            }
        }
        self.push(TokenKind::Str, value, at);
        Ok(())
    }
}

/// Turns template source into a position-tagged token sequence.
pub fn tokenize(source: &str) -> Result<Vec<Token>> {
    Lexer::new(source).tokenize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(tokens: &[Token]) -> Vec<TokenKind> {
        tokens.iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_plain_text() {
        let tokens = tokenize("hello { world }").unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].kind, TokenKind::Text);
        assert_eq!(tokens[0].value, "hello { world }");
    }

    #[test]
    fn test_print_with_filter_chain() {
        let tokens = tokenize("Hi {{ name|repeat:3, \"x\" }}!").unwrap();
        assert_eq!(
            kinds(&tokens),
            vec![
                TokenKind::Text,
                TokenKind::ExprOpen,
                TokenKind::Ident,
                TokenKind::Pipe,
                TokenKind::Ident,
                TokenKind::Colon,
                TokenKind::Number,
                TokenKind::Comma,
                TokenKind::Str,
                TokenKind::ExprClose,
                TokenKind::Text,
            ]
        );
        assert_eq!(tokens[8].value, "x");
        assert_eq!(tokens[10].value, "!");
    }

    #[test]
    fn test_positions() {
        let tokens = tokenize("a\n  {% if x >= 10 %}").unwrap();
        let tag_open = &tokens[1];
        assert_eq!(tag_open.kind, TokenKind::TagOpen);
        assert_eq!(tag_open.pos(), Position::new(2, 3));
        let op = tokens.iter().find(|t| t.kind == TokenKind::Operator).unwrap();
        assert_eq!(op.value, ">=");
        assert_eq!(op.pos(), Position::new(2, 11));
    }

    #[test]
    fn test_path_index_is_not_a_fraction() {
        let tokens = tokenize("{{ items.0.name }}{{ 1.5 }}").unwrap();
        let numbers: Vec<&str> = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Number)
            .map(|t| t.value.as_str())
            .collect();
        assert_eq!(numbers, vec!["0", "1.5"]);
    }

    #[test]
    fn test_string_escapes() {
        let tokens = tokenize(r#"{{ "a\"b\n" }}{{ 'it\'s' }}"#).unwrap();
        assert_eq!(tokens[1].value, "a\"b\n");
        assert_eq!(tokens[4].value, "it's");
    }

    #[test]
    fn test_comments_are_skipped() {
        let tokens = tokenize("a{# {{ ignored }} #}b").unwrap();
        assert_eq!(kinds(&tokens), vec![TokenKind::Text, TokenKind::Text]);
    }

    #[test]
    fn test_unterminated_comment_is_text() {
        let tokens = tokenize("a {# b").unwrap();
        assert_eq!(kinds(&tokens), vec![TokenKind::Text; 3]);
        let text: String = tokens.iter().map(|t| t.value.as_str()).collect();
        assert_eq!(text, "a {# b");
        assert_eq!(tokens[1].pos(), Position::new(1, 3));

        let tokens = tokenize("{# x {{ name }}").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Text);
        assert_eq!(tokens[0].value, "{#");
        assert_eq!(tokens[2].kind, TokenKind::ExprOpen);
    }

    #[test]
    fn test_unterminated_block() {
        let err = tokenize("ok\n{{ name ").unwrap_err();
        assert_eq!(
            err,
            TplError::lex("unterminated `{{` block", Position::new(2, 1))
        );

        let err = tokenize("{% if x }}").unwrap_err();
        assert!(matches!(err, TplError::Lex { .. }));
    }

    #[test]
    fn test_unterminated_string() {
        let err = tokenize("{{ \"abc }}").unwrap_err();
        assert_eq!(
            err,
            TplError::lex("unterminated string literal", Position::new(1, 4))
        );
    }

    #[test]
    fn test_unexpected_character() {
        let err = tokenize("{{ a ^ b }}").unwrap_err();
        assert_eq!(
            err,
            TplError::lex("unexpected character `^`", Position::new(1, 6))
        );
    }
}
