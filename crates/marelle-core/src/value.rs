//! value.rs — Représentation NaN-boxée des valeurs Marelle.
//!
//! Toutes les valeurs du langage tiennent dans 8 octets : un double IEEE-754
//! utilisé tel quel, ou un motif de *quiet NaN* dont les bits bas encodent
//! les singletons (`nil`, `true`, `false`) et les handles d'objets du tas.
//!
//! ## Schéma d'encodage
//!
//! ```text
//! Double :    tout motif dont (bits & QNAN) != QNAN
//! nil :       QNAN | 1
//! false :     QNAN | 2
//! true :      QNAN | 3
//! Objet :     SIGN | QNAN | handle   (handle = index 32 bits dans l'arène)
//! ```
//!
//! Le payload objet est un index d'arène et non un pointeur brut : la
//! sémantique de somme discriminée est identique, et tout le crate reste en
//! Rust sûr (`f64::to_bits`/`from_bits` + masquage entier).

use std::fmt;

use crate::object::Handle;

/// Bits de quiet-NaN réservés. Tout motif qui ne les porte pas tous est un
/// double ordinaire (y compris le NaN "naturel" 0x7ff8…, qui reste un nombre).
const QNAN: u64 = 0x7ffc_0000_0000_0000;

/// Bit de signe : combiné à QNAN, il marque un handle d'objet.
const SIGN_BIT: u64 = 0x8000_0000_0000_0000;

const TAG_NIL: u64 = 1;
const TAG_FALSE: u64 = 2;
const TAG_TRUE: u64 = 3;

/// Une valeur dynamique de la VM, encodée sur 64 bits.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Value(u64);

impl Value {
    /// Le singleton `nil`.
    pub const NIL: Value = Value(QNAN | TAG_NIL);
    /// Le singleton `false`.
    pub const FALSE: Value = Value(QNAN | TAG_FALSE);
    /// Le singleton `true`.
    pub const TRUE: Value = Value(QNAN | TAG_TRUE);

    /// Encode un double.
    #[inline]
    pub fn number(n: f64) -> Value {
        Value(n.to_bits())
    }

    /// Encode un booléen.
    #[inline]
    pub fn boolean(b: bool) -> Value {
        if b {
            Value::TRUE
        } else {
            Value::FALSE
        }
    }

    /// Encode un handle d'objet du tas.
    #[inline]
    pub fn object(handle: Handle) -> Value {
        Value(SIGN_BIT | QNAN | u64::from(handle.index_u32()))
    }

    #[inline]
    pub fn is_number(self) -> bool {
        (self.0 & QNAN) != QNAN
    }

    #[inline]
    pub fn is_nil(self) -> bool {
        self == Value::NIL
    }

    #[inline]
    pub fn is_bool(self) -> bool {
        // `false` et `true` ne diffèrent que par le bit bas.
        (self.0 | 1) == Value::TRUE.0
    }

    #[inline]
    pub fn is_object(self) -> bool {
        (self.0 & (QNAN | SIGN_BIT)) == (QNAN | SIGN_BIT)
    }

    /// `nil` et `false` sont fausses, tout le reste est vrai.
    #[inline]
    pub fn is_falsey(self) -> bool {
        self == Value::NIL || self == Value::FALSE
    }

    /// Le double porté, ou `None` si la valeur n'est pas un nombre.
    #[inline]
    pub fn as_number(self) -> Option<f64> {
        if self.is_number() {
            Some(f64::from_bits(self.0))
        } else {
            None
        }
    }

    /// Le handle porté, ou `None` si la valeur n'est pas un objet.
    #[inline]
    pub fn as_handle(self) -> Option<Handle> {
        if self.is_object() {
            Some(Handle::new((self.0 & !(SIGN_BIT | QNAN)) as u32))
        } else {
            None
        }
    }

    /// Égalité du langage : comparaison numérique entre deux nombres,
    /// identité de bits sinon. L'internement des chaînes fait que l'identité
    /// de bits est la bonne réponse pour `nil`, les booléens et les objets.
    #[inline]
    pub fn equals(self, other: Value) -> bool {
        match (self.as_number(), other.as_number()) {
            (Some(a), Some(b)) => a == b,
            _ => self.0 == other.0,
        }
    }

    /// Motif binaire brut (clef de dé-dupe du pool de constantes).
    #[inline]
    pub fn bits(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(n) = self.as_number() {
            write!(f, "Number({n})")
        } else if self.is_nil() {
            f.write_str("Nil")
        } else if *self == Value::TRUE {
            f.write_str("Bool(true)")
        } else if *self == Value::FALSE {
            f.write_str("Bool(false)")
        } else if let Some(h) = self.as_handle() {
            write!(f, "Object(#{})", h.index())
        } else {
            write!(f, "Value(0x{:016x})", self.0)
        }
    }
}

/// Formate un double comme le `"%g"` de la libc : six chiffres significatifs,
/// notation scientifique quand l'exposant décimal sort de [-4, 6), zéros de
/// queue supprimés, exposant signé sur au moins deux chiffres.
pub fn fmt_g(x: f64) -> String {
    if x.is_nan() {
        return "nan".to_string();
    }
    if x.is_infinite() {
        return if x > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if x == 0.0 {
        return if x.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    // `{:.5e}` donne une mantisse normalisée à 6 chiffres significatifs.
    let sci = format!("{x:.5e}");
    let (mantissa, exp) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (sci.as_str(), 0),
    };
    let negative = mantissa.starts_with('-');
    let digits: String = mantissa.chars().filter(char::is_ascii_digit).collect();
    let sign = if negative { "-" } else { "" };

    if !(-4..6).contains(&exp) {
        // Style scientifique : mantisse sans zéros de queue, exposant C.
        let mant = digits.trim_end_matches('0');
        let mant = if mant.len() <= 1 {
            mant.to_string()
        } else {
            format!("{}.{}", &mant[..1], &mant[1..])
        };
        let (e_sign, e_abs) = if exp < 0 { ('-', -exp) } else { ('+', exp) };
        return format!("{sign}{mant}e{e_sign}{e_abs:02}");
    }

    // Style décimal : place la virgule à exp+1 chiffres du début.
    let rendered = if exp >= 0 {
        let split = (exp + 1) as usize;
        let int_part = &digits[..split];
        let frac = digits[split..].trim_end_matches('0');
        if frac.is_empty() {
            int_part.to_string()
        } else {
            format!("{int_part}.{frac}")
        }
    } else {
        let zeros = "0".repeat((-exp - 1) as usize);
        let frac = digits.trim_end_matches('0');
        format!("0.{zeros}{frac}")
    };
    format!("{sign}{rendered}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nanbox_number_roundtrip() {
        for n in [0.0, -1.5, 3.141_592, f64::MAX, 1e-300] {
            let v = Value::number(n);
            assert!(v.is_number());
            assert_eq!(v.as_number(), Some(n));
            assert!(!v.is_object());
            assert!(!v.is_nil());
        }
        // Un NaN arithmétique reste un nombre, pas un objet.
        let v = Value::number(f64::NAN);
        assert!(v.is_number());
        assert!(!v.is_object());
    }

    #[test]
    fn nanbox_singletons() {
        assert!(Value::NIL.is_nil());
        assert!(Value::TRUE.is_bool());
        assert!(Value::FALSE.is_bool());
        assert!(!Value::NIL.is_bool());
        assert!(!Value::TRUE.is_number());
        assert!(Value::NIL.is_falsey());
        assert!(Value::FALSE.is_falsey());
        assert!(!Value::TRUE.is_falsey());
        assert!(!Value::number(0.0).is_falsey());
    }

    #[test]
    fn nanbox_handle_roundtrip() {
        for idx in [0u32, 1, 255, u32::MAX] {
            let v = Value::object(Handle::new(idx));
            assert!(v.is_object());
            assert!(!v.is_number());
            assert_eq!(v.as_handle(), Some(Handle::new(idx)));
        }
    }

    #[test]
    fn equality_rules() {
        assert!(Value::number(1.0).equals(Value::number(1.0)));
        assert!(!Value::number(1.0).equals(Value::number(2.0)));
        assert!(Value::NIL.equals(Value::NIL));
        assert!(!Value::NIL.equals(Value::FALSE));
        let a = Value::object(Handle::new(7));
        let b = Value::object(Handle::new(7));
        let c = Value::object(Handle::new(8));
        assert!(a.equals(b));
        assert!(!a.equals(c));
        // NaN != NaN, comme en IEEE-754.
        assert!(!Value::number(f64::NAN).equals(Value::number(f64::NAN)));
    }

    #[test]
    fn fmt_g_matches_printf() {
        assert_eq!(fmt_g(7.0), "7");
        assert_eq!(fmt_g(0.0), "0");
        assert_eq!(fmt_g(-0.5), "-0.5");
        assert_eq!(fmt_g(0.5), "0.5");
        assert_eq!(fmt_g(100.0), "100");
        assert_eq!(fmt_g(0.0001), "0.0001");
        assert_eq!(fmt_g(0.00001), "1e-05");
        assert_eq!(fmt_g(1e20), "1e+20");
        assert_eq!(fmt_g(1_234_567.0), "1.23457e+06");
        assert_eq!(fmt_g(123_456.7), "123457");
        assert_eq!(fmt_g(3.5), "3.5");
    }
}
