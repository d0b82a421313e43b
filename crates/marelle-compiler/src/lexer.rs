//! lexer.rs — Découpage lexical, écrit main.
//!
//! Le flux source est un texte ASCII-compatible ; le lexer avance octet par
//! octet, saute blancs et commentaires `//`, et produit un jeton à la fois.
//! Particularité héritée du compilateur mono-passe : les identifiants et les
//! littéraux chaîne portent déjà leur `Value` internée, le générateur de
//! code peut donc les poser en constante sans re-hacher.
//!
//! L'internement passe par le tas, donc par le collecteur : l'appelant
//! fournit ses racines à chaque jeton.

use marelle_core::{Heap, MarkRoots, Value};

/// Nature d'un jeton.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    // Jetons d'un caractère.
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    Comma,
    Dot,
    Minus,
    Plus,
    Semicolon,
    Slash,
    Star,

    // Jetons d'un ou deux caractères.
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,

    // Littéraux.
    Identifier,
    Str,
    Number,

    // Mots-clés.
    Class,
    Else,
    False,
    For,
    Fun,
    If,
    Nil,
    Print,
    Return,
    Super,
    This,
    True,
    Var,
    While,

    Eof,
}

/// Un jeton : sa nature, sa ligne, et la valeur qu'il transporte
/// (`nil` sauf pour nombres, chaînes et identifiants).
#[derive(Debug, Clone, Copy)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
    pub value: Value,
}

impl Token {
    /// Jeton de remplissage avant la première lecture.
    pub fn placeholder() -> Token {
        Token { kind: TokenKind::Eof, line: 1, value: Value::NIL }
    }
}

/// Erreur lexicale : caractère inattendu ou chaîne non terminée.
#[derive(Debug, Clone, Copy)]
pub struct ScanError {
    pub line: u32,
    pub message: &'static str,
}

fn keyword(text: &str) -> Option<TokenKind> {
    // La liste du langage ; `and`/`or` n'en font pas partie.
    Some(match text {
        "class" => TokenKind::Class,
        "else" => TokenKind::Else,
        "false" => TokenKind::False,
        "for" => TokenKind::For,
        "fun" => TokenKind::Fun,
        "if" => TokenKind::If,
        "nil" => TokenKind::Nil,
        "print" => TokenKind::Print,
        "return" => TokenKind::Return,
        "super" => TokenKind::Super,
        "this" => TokenKind::This,
        "true" => TokenKind::True,
        "var" => TokenKind::Var,
        "while" => TokenKind::While,
        _ => return None,
    })
}

fn is_name_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_name_continue(c: u8) -> bool {
    is_name_start(c) || c.is_ascii_digit()
}

/// Le lexer : un curseur sur le source.
pub struct Lexer<'src> {
    src: &'src str,
    start: usize,
    pos: usize,
    line: u32,
}

impl<'src> Lexer<'src> {
    pub fn new(source: &'src str) -> Lexer<'src> {
        Lexer { src: source, start: 0, pos: 0, line: 1 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn peek(&self) -> u8 {
        self.src.as_bytes().get(self.pos).copied().unwrap_or(0)
    }

    fn peek_next(&self) -> u8 {
        self.src.as_bytes().get(self.pos + 1).copied().unwrap_or(0)
    }

    fn bump(&mut self) -> u8 {
        let c = self.peek();
        self.pos += 1;
        c
    }

    fn eat(&mut self, expected: u8) -> bool {
        if self.peek() == expected {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn token(&self, kind: TokenKind) -> Token {
        Token { kind, line: self.line, value: Value::NIL }
    }

    fn skip_blanks(&mut self) {
        loop {
            match self.peek() {
                b' ' | b'\r' | b'\t' => {
                    self.pos += 1;
                }
                b'\n' => {
                    self.line += 1;
                    self.pos += 1;
                }
                b'/' if self.peek_next() == b'/' => {
                    while !self.at_end() && self.peek() != b'\n' {
                        self.pos += 1;
                    }
                }
                _ => return,
            }
        }
    }

    /// Le jeton suivant. `roots` racine les objets du compilateur pendant
    /// les internements que la lecture peut provoquer.
    pub fn next_token(
        &mut self,
        heap: &mut Heap,
        roots: &dyn MarkRoots,
    ) -> Result<Token, ScanError> {
        self.skip_blanks();
        self.start = self.pos;
        if self.at_end() {
            return Ok(self.token(TokenKind::Eof));
        }

        let c = self.bump();
        let token = match c {
            b'(' => self.token(TokenKind::LeftParen),
            b')' => self.token(TokenKind::RightParen),
            b'{' => self.token(TokenKind::LeftBrace),
            b'}' => self.token(TokenKind::RightBrace),
            b',' => self.token(TokenKind::Comma),
            b'.' => self.token(TokenKind::Dot),
            b'-' => self.token(TokenKind::Minus),
            b'+' => self.token(TokenKind::Plus),
            b';' => self.token(TokenKind::Semicolon),
            b'*' => self.token(TokenKind::Star),
            b'/' => self.token(TokenKind::Slash),
            b'!' => {
                let kind = if self.eat(b'=') { TokenKind::BangEqual } else { TokenKind::Bang };
                self.token(kind)
            }
            b'=' => {
                let kind = if self.eat(b'=') { TokenKind::EqualEqual } else { TokenKind::Equal };
                self.token(kind)
            }
            b'<' => {
                let kind = if self.eat(b'=') { TokenKind::LessEqual } else { TokenKind::Less };
                self.token(kind)
            }
            b'>' => {
                let kind =
                    if self.eat(b'=') { TokenKind::GreaterEqual } else { TokenKind::Greater };
                self.token(kind)
            }
            b'"' => return self.string(heap, roots),
            c if c.is_ascii_digit() => self.number(),
            c if is_name_start(c) => self.name(heap, roots),
            _ => return Err(ScanError { line: self.line, message: "Unexpected character." }),
        };
        Ok(token)
    }

    /// Littéral chaîne, sans échappements. Le contenu est interné tel quel.
    fn string(&mut self, heap: &mut Heap, roots: &dyn MarkRoots) -> Result<Token, ScanError> {
        while !self.at_end() && self.peek() != b'"' {
            if self.peek() == b'\n' {
                self.line += 1;
            }
            self.pos += 1;
        }
        if !self.eat(b'"') {
            return Err(ScanError { line: self.line, message: "Unterminated string." });
        }
        let text = &self.src[self.start + 1..self.pos - 1];
        let handle = heap.intern(text, roots);
        Ok(Token { kind: TokenKind::Str, line: self.line, value: Value::object(handle) })
    }

    /// Nombre décimal, partie fractionnaire optionnelle.
    fn number(&mut self) -> Token {
        while self.peek().is_ascii_digit() {
            self.pos += 1;
        }
        if self.peek() == b'.' && self.peek_next().is_ascii_digit() {
            self.pos += 1;
            while self.peek().is_ascii_digit() {
                self.pos += 1;
            }
        }
        let n = self.src[self.start..self.pos].parse::<f64>().unwrap_or(0.0);
        Token { kind: TokenKind::Number, line: self.line, value: Value::number(n) }
    }

    /// Identifiant ou mot-clé.
    fn name(&mut self, heap: &mut Heap, roots: &dyn MarkRoots) -> Token {
        while is_name_continue(self.peek()) {
            self.pos += 1;
        }
        let text = &self.src[self.start..self.pos];
        if let Some(kind) = keyword(text) {
            return self.token(kind);
        }
        let handle = heap.intern(text, roots);
        Token { kind: TokenKind::Identifier, line: self.line, value: Value::object(handle) }
    }
}
