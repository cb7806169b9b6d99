// Copyright 2026 The Arraycalc Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::str::CharIndices;

use unicode_xid::UnicodeXID;

use self::Token::*;
use crate::common::ErrorCode::*;
use crate::common::{EquationError, ErrorCode};


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Token<'input> {
    Plus,
    Minus,
    Mul,
    Div,
    Mod,
    Pow,
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
    Neq,
    MinOp,
    MaxOp,
    And,
    Or,
    Xor,
    BitAnd,
    BitOr,
    BitNot,
    Not,
    Shl,
    Shr,
    Assign,
    Question,
    Colon,
    Comma,
    Semi,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LCurly,
    RCurly,
    At,
    AtAt,
    Until,
    Ident(&'input str),
    Num(&'input str),
}

fn error<T>(code: ErrorCode, start: usize, end: usize) -> Result<T, EquationError> {
    Err(EquationError {
        start: start as u16,
        end: end as u16,
        code,
    })
}

pub type Spanned<T> = (usize, T, usize);

pub struct Lexer<'input> {
    text: &'input str,
    chars: CharIndices<'input>,
    lookahead: Option<(usize, char)>,
}

// word operators; everything wordy that isn't here is resolved by the
// compiler's operand table (slot names, functions, constants)
const KEYWORDS: &[(&str, Token<'static>)] = &[
    ("and", BitAnd),
    ("or", BitOr),
    ("xor", Xor),
    ("until", Until),
];

impl<'input> Lexer<'input> {
    pub fn new(input: &'input str) -> Self {
        let mut t = Lexer {
            text: input,
            chars: input.char_indices(),
            lookahead: None,
        };
        t.bump();
        t
    }

    fn bump(&mut self) -> Option<(usize, char)> {
        self.lookahead = self.chars.next();
        self.lookahead
    }

    fn word(&mut self, idx0: usize) -> Spanned<&'input str> {
        match self.take_while(is_identifier_continue) {
            Some(end) => (idx0, &self.text[idx0..end], end),
            None => (idx0, &self.text[idx0..], self.text.len()),
        }
    }

    fn take_while<F>(&mut self, mut keep_going: F) -> Option<usize>
    where
        F: FnMut(char) -> bool,
    {
        loop {
            match self.lookahead {
                None => {
                    return None;
                }
                Some((idx1, c)) => {
                    if !keep_going(c) {
                        return Some(idx1);
                    } else {
                        self.bump();
                    }
                }
            }
        }
    }

    fn identifierish(&mut self, idx0: usize) -> Spanned<Token<'input>> {
        let (start, word, end) = self.word(idx0);
        let lower_word = word.to_lowercase();

        let tok = KEYWORDS
            .iter()
            .filter(|&&(w, _)| w == lower_word)
            .map(|(_, t)| *t)
            .next()
            .unwrap_or(Ident(word));

        (start, tok, end)
    }

    // digits, optional fraction, optional exponent; a malformed tail
    // like `1e+` is swallowed here and rejected as BadLiteral when the
    // compiler parses the text
    fn number(&mut self, idx0: usize) -> Spanned<Token<'input>> {
        self.take_while(is_digit);
        if let Some((_, '.')) = self.lookahead {
            self.bump();
            self.take_while(is_digit);
        }
        if let Some((_, 'e' | 'E')) = self.lookahead {
            self.bump();
            if let Some((_, '+' | '-')) = self.lookahead {
                self.bump();
            }
            self.take_while(is_digit);
        }

        let end = match self.lookahead {
            Some((idx1, _)) => idx1,
            None => self.text.len(),
        };
        (idx0, Num(&self.text[idx0..end]), end)
    }

    #[allow(clippy::unnecessary_wraps)]
    fn consume(
        &mut self,
        i: usize,
        tok: Token<'input>,
        len: usize,
    ) -> Option<Result<Spanned<Token<'input>>, EquationError>> {
        self.bump();
        Some(Ok((i, tok, i + len)))
    }
}

impl<'input> Iterator for Lexer<'input> {
    type Item = Result<Spanned<Token<'input>>, EquationError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            return match self.lookahead {
                Some((i, '+')) => self.consume(i, Plus, 1),
                Some((i, '-')) => self.consume(i, Minus, 1),
                Some((i, '/')) => self.consume(i, Div, 1),
                Some((i, '%')) => self.consume(i, Mod, 1),
                Some((i, '^')) => self.consume(i, Pow, 1),
                Some((i, '~')) => self.consume(i, BitNot, 1),
                Some((i, '#')) => self.consume(i, Neq, 1),
                Some((i, '?')) => self.consume(i, Question, 1),
                Some((i, ',')) => self.consume(i, Comma, 1),
                Some((i, ';')) => self.consume(i, Semi, 1),
                Some((i, '(')) => self.consume(i, LParen, 1),
                Some((i, ')')) => self.consume(i, RParen, 1),
                Some((i, '[')) => self.consume(i, LBracket, 1),
                Some((i, ']')) => self.consume(i, RBracket, 1),
                Some((i, '{')) => self.consume(i, LCurly, 1),
                Some((i, '}')) => self.consume(i, RCurly, 1),
                Some((i, '*')) => {
                    match self.bump() {
                        Some((_, '*')) => self.consume(i, Pow, 2),
                        // we've already bumped, don't consume
                        _ => Some(Ok((i, Mul, i + 1))),
                    }
                }
                Some((i, '<')) => {
                    match self.bump() {
                        Some((_, '=')) => self.consume(i, Lte, 2),
                        Some((_, '<')) => self.consume(i, Shl, 2),
                        Some((_, '?')) => self.consume(i, MinOp, 2),
                        // we've already bumped, don't consume
                        _ => Some(Ok((i, Lt, i + 1))),
                    }
                }
                Some((i, '>')) => {
                    match self.bump() {
                        Some((_, '=')) => self.consume(i, Gte, 2),
                        Some((_, '>')) => self.consume(i, Shr, 2),
                        Some((_, '?')) => self.consume(i, MaxOp, 2),
                        // we've already bumped, don't consume
                        _ => Some(Ok((i, Gt, i + 1))),
                    }
                }
                Some((i, '=')) => {
                    match self.bump() {
                        Some((_, '=')) => self.consume(i, Eq, 2),
                        // single '=' is the same comparison
                        _ => Some(Ok((i, Eq, i + 1))),
                    }
                }
                Some((i, '!')) => {
                    match self.bump() {
                        Some((_, '=')) => self.consume(i, Neq, 2),
                        _ => Some(Ok((i, Not, i + 1))),
                    }
                }
                Some((i, '&')) => {
                    match self.bump() {
                        Some((_, '&')) => self.consume(i, And, 2),
                        _ => Some(Ok((i, BitAnd, i + 1))),
                    }
                }
                Some((i, '|')) => {
                    match self.bump() {
                        Some((_, '|')) => self.consume(i, Or, 2),
                        _ => Some(Ok((i, BitOr, i + 1))),
                    }
                }
                Some((i, ':')) => {
                    match self.bump() {
                        Some((_, '=')) => self.consume(i, Assign, 2),
                        _ => Some(Ok((i, Colon, i + 1))),
                    }
                }
                Some((i, '@')) => {
                    match self.bump() {
                        Some((_, '@')) => self.consume(i, AtAt, 2),
                        _ => Some(Ok((i, At, i + 1))),
                    }
                }
                Some((i, c)) if is_identifier_start(c) => Some(Ok(self.identifierish(i))),
                Some((i, c)) if is_number_start(c) => Some(Ok(self.number(i))),
                Some((_, c)) if c.is_whitespace() => {
                    self.bump();
                    continue;
                }
                Some((i, _)) => {
                    self.bump(); // eat whatever is killing us
                    let end = match self.lookahead {
                        Some((end, _)) => end,
                        None => self.text.len(),
                    };
                    Some(error(UnknownToken, i, end))
                }
                None => None,
            };
        }
    }
}

fn is_number_start(c: char) -> bool {
    is_digit(c) || c == '.'
}

fn is_digit(c: char) -> bool {
    c.is_ascii_digit()
}

fn is_identifier_start(c: char) -> bool {
    UnicodeXID::is_xid_start(c) || c == '_'
}

fn is_identifier_continue(c: char) -> bool {
    UnicodeXID::is_xid_continue(c)
}
