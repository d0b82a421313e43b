//! table.rs — Table de hachage à adressage ouvert (sondage linéaire).
//!
//! Sert aux globales de la VM et à l'internement des chaînes. Les clefs sont
//! des handles de chaînes internées ; l'appelant fournit le hachage FNV-1a
//! (stocké dans l'objet chaîne), la table le mémorise par entrée pour les
//! réagrandissements.
//!
//! Conventions héritées du format d'entrée :
//! - entrée vide       : `key == None`, `value == nil`
//! - pierre tombale    : `key == None`, `value == true`
//!
//! Le sondage saute les pierres tombales mais s'arrête sur une entrée
//! réellement vide ; `count` compte entrées vivantes *et* tombales, si bien
//! que la charge déclenchant la croissance tient compte des deux. La
//! croissance re-hache les entrées vivantes et laisse tomber les tombales.

use crate::object::{Handle, ObjString};
use crate::value::Value;

const MAX_LOAD_NUM: usize = 3;
const MAX_LOAD_DEN: usize = 4;
const MIN_CAPACITY: usize = 8;

#[derive(Clone, Copy)]
struct Entry {
    key: Option<Handle>,
    hash: u32,
    value: Value,
}

impl Entry {
    const EMPTY: Entry = Entry { key: None, hash: 0, value: Value::NIL };
}

/// Table `{clef: chaîne internée, valeur: Value}`.
pub struct Table {
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Table {
        Table { count: 0, entries: Vec::new() }
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Index de l'entrée pour `key` : soit l'entrée vivante, soit la
    /// première tombale rencontrée, soit l'entrée vide qui clôt la sonde.
    fn find_entry(entries: &[Entry], key: Handle, hash: u32) -> usize {
        let capacity = entries.len();
        let mut index = hash as usize % capacity;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            match entry.key {
                None => {
                    if entry.value.is_nil() {
                        return tombstone.unwrap_or(index);
                    }
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Some(k) if k == key => return index,
                Some(_) => {}
            }
            index = (index + 1) % capacity;
        }
    }

    fn grow(&mut self) {
        let new_capacity = if self.capacity() < MIN_CAPACITY {
            MIN_CAPACITY
        } else {
            self.capacity() * 2
        };
        let old = std::mem::replace(&mut self.entries, vec![Entry::EMPTY; new_capacity]);
        self.count = 0;
        for entry in old {
            if let Some(key) = entry.key {
                let index = Self::find_entry(&self.entries, key, entry.hash);
                self.entries[index] = entry;
                self.count += 1;
            }
        }
    }

    /// Lit la valeur associée à `key`.
    pub fn get(&self, key: Handle, hash: u32) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let index = Self::find_entry(&self.entries, key, hash);
        let entry = &self.entries[index];
        entry.key.map(|_| entry.value)
    }

    /// Insère ou met à jour. Renvoie `true` si la clef est nouvelle.
    pub fn set(&mut self, key: Handle, hash: u32, value: Value) -> bool {
        if (self.count + 1) * MAX_LOAD_DEN > self.capacity() * MAX_LOAD_NUM {
            self.grow();
        }
        let index = Self::find_entry(&self.entries, key, hash);
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_none();
        // Recycler une tombale ne grossit pas `count`.
        if is_new && entry.value.is_nil() {
            self.count += 1;
        }
        *entry = Entry { key: Some(key), hash, value };
        is_new
    }

    /// Remplace l'entrée par une pierre tombale. Renvoie `true` si la clef
    /// était présente.
    pub fn delete(&mut self, key: Handle, hash: u32) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = Self::find_entry(&self.entries, key, hash);
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }
        *entry = Entry { key: None, hash: 0, value: Value::TRUE };
        true
    }

    /// Recherche par contenu, utilisée uniquement par l'interneur : le seul
    /// appelant qui n'a pas encore d'objet chaîne sous la main. `string_of`
    /// résout un handle vers sa chaîne.
    pub fn find_string<'s>(
        &self,
        text: &str,
        hash: u32,
        string_of: impl Fn(Handle) -> &'s ObjString,
    ) -> Option<Handle> {
        if self.count == 0 {
            return None;
        }
        let capacity = self.capacity();
        let mut index = hash as usize % capacity;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    // Une vraie entrée vide clôt la sonde ; une tombale non.
                    if entry.value.is_nil() {
                        return None;
                    }
                }
                Some(key) => {
                    let s = string_of(key);
                    if s.hash == hash && &*s.chars == text {
                        return Some(key);
                    }
                }
            }
            index = (index + 1) % capacity;
        }
    }

    /// Balayage faible de l'interneur : tombale toute entrée dont la clef
    /// n'est pas marquée.
    pub fn remove_unmarked(&mut self, is_marked: impl Fn(Handle) -> bool) {
        for entry in &mut self.entries {
            if let Some(key) = entry.key {
                if !is_marked(key) {
                    *entry = Entry { key: None, hash: 0, value: Value::TRUE };
                }
            }
        }
    }

    /// Entrées vivantes `(clef, valeur)`.
    pub fn iter(&self) -> impl Iterator<Item = (Handle, Value)> + '_ {
        self.entries.iter().filter_map(|e| e.key.map(|k| (k, e.value)))
    }

    /// Nombre d'entrées vivantes (les tombales ne comptent pas ici).
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.key.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Vide la table (équivalent de `freeTable`).
    pub fn clear(&mut self) {
        self.count = 0;
        self.entries.clear();
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(i: u32) -> Handle {
        Handle::new(i)
    }

    #[test]
    fn set_get_update() {
        let mut t = Table::new();
        assert!(t.set(key(1), 42, Value::number(1.0)));
        assert!(!t.set(key(1), 42, Value::number(2.0)));
        assert_eq!(t.get(key(1), 42), Some(Value::number(2.0)));
        assert_eq!(t.get(key(2), 42), None);
    }

    #[test]
    fn delete_leaves_probe_sequence_intact() {
        let mut t = Table::new();
        // Trois clefs qui se bousculent sur le même point d'entrée.
        t.set(key(1), 8, Value::number(1.0));
        t.set(key(2), 8, Value::number(2.0));
        t.set(key(3), 8, Value::number(3.0));
        assert!(t.delete(key(2), 8));
        // La tombale ne doit pas couper la sonde vers key(3).
        assert_eq!(t.get(key(3), 8), Some(Value::number(3.0)));
        assert_eq!(t.get(key(2), 8), None);
        assert!(!t.delete(key(2), 8));
        // Réinsérer recycle la tombale.
        assert!(t.set(key(2), 8, Value::number(4.0)));
        assert_eq!(t.get(key(2), 8), Some(Value::number(4.0)));
    }

    #[test]
    fn growth_drops_tombstones() {
        let mut t = Table::new();
        for i in 0..32 {
            t.set(key(i), i, Value::number(f64::from(i)));
        }
        for i in 0..16 {
            t.delete(key(i), i);
        }
        for i in 32..64 {
            t.set(key(i), i, Value::number(f64::from(i)));
        }
        for i in 16..64 {
            assert_eq!(t.get(key(i), i), Some(Value::number(f64::from(i))), "clef {i}");
        }
        for i in 0..16 {
            assert_eq!(t.get(key(i), i), None);
        }
        assert_eq!(t.len(), 48);
    }
}
