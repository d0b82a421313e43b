//! marelle-compiler — Frontend du langage Marelle
//!
//! Lexer écrit main, parser de Pratt et génération de bytecode en une seule
//! passe : le texte source descend directement en octets, sans arbre
//! intermédiaire. Le résultat est une fonction script dans le tas fourni.
//!
//! ## Modules
//! - `lexer`   : découpage lexical, jetons porteurs de valeurs internées.
//! - `codegen` : grammaire de Pratt, portées, fermetures, appels terminaux,
//!   diagnostics.
//!
//! Pendant la compilation, la chaîne des fonctions en construction sert de
//! racine au ramasse-miettes ; l'appelant fournit ses propres racines
//! persistantes à [`codegen::compile`].

pub mod codegen;
pub mod lexer;

pub use codegen::{compile, CompileError, CompileErrors};
pub use lexer::{Lexer, Token, TokenKind};
