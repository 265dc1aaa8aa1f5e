//! Lexer for the Veld language, built on logos.
//!
//! Spaces, tabs, and comments are skipped; newlines are real tokens
//! because they separate statements. The logos token enum is internal
//! and converted to [`Token`] with spans after lexing.

use crate::token::{Span, Token};
use logos::Logos;

#[derive(Logos, Debug, Clone, PartialEq)]
enum LogosToken {
    #[regex(r"[ \t\r]+", logos::skip)]
    Whitespace,

    #[regex(r"//[^\n]*", logos::skip)]
    LineComment,

    #[regex(r"\n+")]
    Newline,

    #[regex(r"[0-9]+(\.[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    Number(f64),

    #[regex(r#""([^"\\\n]|\\.)*""#, lex_string)]
    Str(String),

    // Keywords before identifiers.
    #[token("in")]
    In,
    #[token("defer")]
    Defer,
    #[token("ret")]
    Ret,
    #[token("import")]
    Import,
    #[token("break")]
    Break,
    #[token("continue")]
    Continue,
    #[token("or!")]
    OrBang,

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    #[token(":=")]
    ColonEq,
    #[token("<-")]
    LeftArrow,
    #[token("->")]
    Arrow,
    #[token("=>")]
    FatArrow,
    #[token("~>")]
    TildeArrow,
    #[token("==")]
    EqEq,
    #[token("!=")]
    BangEq,
    #[token("<=")]
    Le,
    #[token(">=")]
    Ge,
    #[token("..")]
    DotDot,
    #[token("@@")]
    AtAt,

    #[token("=")]
    Eq,
    #[token("@")]
    At,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token(",")]
    Comma,
    #[token(";")]
    Semi,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
}

fn lex_string(lex: &mut logos::Lexer<LogosToken>) -> Option<String> {
    let raw = lex.slice();
    let inner = &raw[1..raw.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next()? {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                '0' => out.push('\0'),
                '\\' => out.push('\\'),
                '"' => out.push('"'),
                _ => return None,
            }
        } else {
            out.push(c);
        }
    }
    Some(out)
}

/// A lexical error: the byte span that could not be tokenized.
#[derive(Debug, Clone)]
pub struct LexError {
    pub span: Span,
}

/// Tokenize a source file into `(token, span)` pairs.
pub fn lex(source: &str) -> Result<Vec<(Token, Span)>, LexError> {
    let mut out = Vec::new();
    let mut lexer = LogosToken::lexer(source);
    while let Some(result) = lexer.next() {
        let span = Span::new(lexer.span().start, lexer.span().end);
        let token = match result {
            Err(()) => return Err(LexError { span }),
            Ok(t) => t,
        };
        let token = match token {
            LogosToken::Whitespace | LogosToken::LineComment => continue,
            LogosToken::Newline => Token::Newline,
            LogosToken::Number(n) => Token::Number(n),
            LogosToken::Str(s) => Token::Str(s),
            LogosToken::Ident(s) => Token::Ident(s),
            LogosToken::In => Token::In,
            LogosToken::Defer => Token::Defer,
            LogosToken::Ret => Token::Ret,
            LogosToken::Import => Token::Import,
            LogosToken::Break => Token::Break,
            LogosToken::Continue => Token::Continue,
            LogosToken::OrBang => Token::OrBang,
            LogosToken::ColonEq => Token::ColonEq,
            LogosToken::LeftArrow => Token::LeftArrow,
            LogosToken::Arrow => Token::Arrow,
            LogosToken::FatArrow => Token::FatArrow,
            LogosToken::TildeArrow => Token::TildeArrow,
            LogosToken::EqEq => Token::EqEq,
            LogosToken::BangEq => Token::BangEq,
            LogosToken::Le => Token::Le,
            LogosToken::Ge => Token::Ge,
            LogosToken::DotDot => Token::DotDot,
            LogosToken::AtAt => Token::AtAt,
            LogosToken::Eq => Token::Eq,
            LogosToken::At => Token::At,
            LogosToken::LBrace => Token::LBrace,
            LogosToken::RBrace => Token::RBrace,
            LogosToken::LParen => Token::LParen,
            LogosToken::RParen => Token::RParen,
            LogosToken::Comma => Token::Comma,
            LogosToken::Semi => Token::Semi,
            LogosToken::Plus => Token::Plus,
            LogosToken::Minus => Token::Minus,
            LogosToken::Star => Token::Star,
            LogosToken::Slash => Token::Slash,
            LogosToken::Percent => Token::Percent,
            LogosToken::Lt => Token::Lt,
            LogosToken::Gt => Token::Gt,
        };
        out.push((token, span));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(src: &str) -> Vec<Token> {
        lex(src).unwrap().into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn test_bindings_and_numbers() {
        assert_eq!(
            tokens("main = 42"),
            [Token::Ident("main".into()), Token::Eq, Token::Number(42.0)]
        );
        assert_eq!(
            tokens("x := 1.5"),
            [Token::Ident("x".into()), Token::ColonEq, Token::Number(1.5)]
        );
    }

    #[test]
    fn test_strings_with_escapes() {
        assert_eq!(
            tokens(r#"println("Hello, World!\n")"#),
            [
                Token::Ident("println".into()),
                Token::LParen,
                Token::Str("Hello, World!\n".into()),
                Token::RParen,
            ]
        );
    }

    #[test]
    fn test_arrows_are_distinct() {
        assert_eq!(
            tokens("-> => ~> <-"),
            [Token::Arrow, Token::FatArrow, Token::TildeArrow, Token::LeftArrow]
        );
    }

    #[test]
    fn test_loop_header() {
        assert_eq!(
            tokens("@ i in 1..10"),
            [
                Token::At,
                Token::Ident("i".into()),
                Token::In,
                Token::Number(1.0),
                Token::DotDot,
                Token::Number(10.0),
            ]
        );
    }

    #[test]
    fn test_or_bang_is_one_token() {
        assert_eq!(
            tokens("x or! 99"),
            [Token::Ident("x".into()), Token::OrBang, Token::Number(99.0)]
        );
        // A bare `or` is just an identifier.
        assert_eq!(tokens("or"), [Token::Ident("or".into())]);
    }

    #[test]
    fn test_newlines_collapse() {
        assert_eq!(
            tokens("a\n\n\nb"),
            [
                Token::Ident("a".into()),
                Token::Newline,
                Token::Ident("b".into())
            ]
        );
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            tokens("a // trailing\nb"),
            [
                Token::Ident("a".into()),
                Token::Newline,
                Token::Ident("b".into())
            ]
        );
    }

    #[test]
    fn test_unterminated_string_is_an_error() {
        assert!(lex("\"abc").is_err());
    }
}
