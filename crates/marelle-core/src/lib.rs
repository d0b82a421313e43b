//! marelle-core — Cœur du langage Marelle
//!
//! Contient tout ce qu'il faut pour représenter et exécuter le bytecode
//! Marelle, sans dépendre du compilateur ni de la VM complète.
//!
//! ## Modules
//! - `value`    : valeur 64 bits NaN-boxée (double, singletons, handles).
//! - `bytecode` : format `Chunk`, pool de constantes, opcodes `Op`,
//!   désassembleur.
//! - `object`   : objets du tas (chaîne, fonction, fermeture, upvalue,
//!   native) et leurs handles.
//! - `table`    : table de hachage à adressage ouvert (globales, interneur).
//! - `heap`     : arène d'objets, internement, ramasse-miettes mark-sweep.
//!
//! Le tas possède tous les objets ; la VM et le compilateur n'en gardent
//! que des handles, et déclarent leurs racines au collecteur via le trait
//! [`heap::MarkRoots`].

pub mod bytecode;
pub mod heap;
pub mod object;
pub mod table;
pub mod value;

// ---------- Reexports de confort ----------
pub use bytecode::{Chunk, Op};
pub use heap::{Heap, MarkRoots, NoRoots};
pub use object::{Handle, NativeFn, Obj, ObjClosure, ObjFn, ObjNative, ObjString, ObjUpvalue};
pub use table::Table;
pub use value::Value;

/// Version du crate (lisible, via Cargo).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
