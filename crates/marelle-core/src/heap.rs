//! heap.rs — Arène d'objets, internement des chaînes et ramasse-miettes.
//!
//! Le tas est une arène de slots : chaque objet vivant occupe un slot avec
//! son bit de marquage et sa taille comptabilisée ; une liste libre recycle
//! les slots balayés. Le [`Handle`] est l'index de slot, ce qui remplace la
//! liste chaînée d'allocation du schéma classique tout en gardant la même
//! sémantique : le tas possède tous les objets, le collecteur est le seul à
//! les libérer.
//!
//! Le collecteur est un mark-sweep stop-the-world avec worklist grise.
//! Les racines ne vivent pas dans le tas (pile de la VM, frames, globales,
//! chaîne des compilateurs imbriqués) : elles s'injectent par le trait
//! [`MarkRoots`], fourni à chaque allocation susceptible de collecter.
//!
//! La worklist grise et le stockage des tables passent par l'allocateur
//! hôte, jamais par la comptabilité du tas : le marquage ne peut donc pas
//! déclencher une collecte récursive.

use log::{debug, trace};

use crate::object::{Handle, Obj, ObjClosure, ObjFn, ObjString, ObjUpvalue};
use crate::table::Table;
use crate::value::{fmt_g, Value};

/// Seuil initial avant la première collecte (1 Mio).
const FIRST_GC_THRESHOLD: usize = 1024 * 1024;

/// Facteur de croissance du seuil après collecte.
const HEAP_GROW_FACTOR: usize = 2;

/// Fournisseur de racines pour le collecteur. La VM en implémente un (pile,
/// frames, globales, upvalues ouverts), le compilateur un autre (chaîne des
/// fonctions en cours), qui chaîne celui de la VM.
pub trait MarkRoots {
    fn mark_roots(&self, heap: &mut Heap);
}

/// Aucune racine : tout objet non internement-joignable meurt. Utile aux
/// tests et au démontage.
pub struct NoRoots;

impl MarkRoots for NoRoots {
    fn mark_roots(&self, _heap: &mut Heap) {}
}

struct Slot {
    obj: Obj,
    marked: bool,
    /// Taille retenue à l'allocation ; la libération soustrait exactement
    /// ce nombre, la comptabilité est donc symétrique.
    size: usize,
}

/// L'arène d'objets et l'état du collecteur.
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    /// Interneur : table faible, balayée avant le sweep.
    strings: Table,
    gray: Vec<Handle>,
    bytes_allocated: usize,
    next_gc: usize,
    stress: bool,
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            slots: Vec::new(),
            free: Vec::new(),
            strings: Table::new(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_THRESHOLD,
            stress: false,
        }
    }

    /// Force une collecte avant chaque allocation (mode test).
    pub fn set_stress(&mut self, on: bool) {
        self.stress = on;
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Nombre d'objets vivants dans l'arène.
    pub fn object_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    // ---------- Allocation ----------

    /// Alloue un objet. Peut déclencher une collecte *avant* d'insérer
    /// l'objet : tout objet transitoire déjà alloué doit être joignable
    /// depuis `roots` à ce moment-là.
    pub fn alloc(&mut self, obj: Obj, roots: &dyn MarkRoots) -> Handle {
        if self.stress || self.bytes_allocated > self.next_gc {
            self.collect(roots);
        }
        let size = obj.heap_size();
        self.bytes_allocated += size;
        let slot = Slot { obj, marked: false, size };
        let handle = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(slot);
                Handle::new(index)
            }
            None => {
                self.slots.push(Some(slot));
                Handle::new((self.slots.len() - 1) as u32)
            }
        };
        trace!("alloc #{} ({} octets)", handle.index(), size);
        handle
    }

    /// Interne une chaîne : renvoie le handle existant si le contenu est
    /// déjà connu, sinon alloue et enregistre. Après internement, l'égalité
    /// de contenu est l'égalité de handle.
    pub fn intern(&mut self, text: &str, roots: &dyn MarkRoots) -> Handle {
        let hash = fnv1a(text.as_bytes());
        let slots = &self.slots;
        let found = self.strings.find_string(text, hash, |h| {
            match &slots[h.index()] {
                Some(slot) => match &slot.obj {
                    Obj::Str(s) => s,
                    _ => panic!("intern table holds a non-string key"),
                },
                None => panic!("intern table holds a freed key"),
            }
        });
        if let Some(handle) = found {
            return handle;
        }
        let handle = self.alloc(Obj::Str(ObjString { chars: text.into(), hash }), roots);
        self.strings.set(handle, hash, Value::NIL);
        handle
    }

    /// Retrouve une chaîne déjà internée, sans allouer. `None` si ce
    /// contenu n'a jamais été interné (ou a été collecté).
    pub fn lookup_interned(&self, text: &str) -> Option<Handle> {
        let hash = fnv1a(text.as_bytes());
        let slots = &self.slots;
        self.strings.find_string(text, hash, |h| match &slots[h.index()] {
            Some(slot) => match &slot.obj {
                Obj::Str(s) => s,
                _ => panic!("intern table holds a non-string key"),
            },
            None => panic!("intern table holds a freed key"),
        })
    }

    // ---------- Accès typés ----------

    /// L'objet derrière `handle`.
    pub fn get(&self, handle: Handle) -> &Obj {
        match &self.slots[handle.index()] {
            Some(slot) => &slot.obj,
            None => panic!("use of freed object #{}", handle.index()),
        }
    }

    fn get_mut(&mut self, handle: Handle) -> &mut Obj {
        match &mut self.slots[handle.index()] {
            Some(slot) => &mut slot.obj,
            None => panic!("use of freed object #{}", handle.index()),
        }
    }

    pub fn string(&self, handle: Handle) -> &ObjString {
        match self.get(handle) {
            Obj::Str(s) => s,
            other => panic!("expected string, got {other:?}"),
        }
    }

    pub fn function(&self, handle: Handle) -> &ObjFn {
        match self.get(handle) {
            Obj::Fn(f) => f,
            other => panic!("expected function, got {other:?}"),
        }
    }

    /// Accès mutable à une fonction en cours de construction. Réservé au
    /// compilateur ; une fonction finie ne doit plus bouger.
    pub fn function_mut(&mut self, handle: Handle) -> &mut ObjFn {
        match self.get_mut(handle) {
            Obj::Fn(f) => f,
            other => panic!("expected function, got {other:?}"),
        }
    }

    pub fn closure(&self, handle: Handle) -> &ObjClosure {
        match self.get(handle) {
            Obj::Closure(c) => c,
            other => panic!("expected closure, got {other:?}"),
        }
    }

    /// Accès mutable à une fermeture le temps de remplir son tableau
    /// d'upvalues, juste après l'allocation.
    pub fn closure_mut(&mut self, handle: Handle) -> &mut ObjClosure {
        match self.get_mut(handle) {
            Obj::Closure(c) => c,
            other => panic!("expected closure, got {other:?}"),
        }
    }

    pub fn upvalue(&self, handle: Handle) -> &ObjUpvalue {
        match self.get(handle) {
            Obj::Upvalue(u) => u,
            other => panic!("expected upvalue, got {other:?}"),
        }
    }

    pub fn upvalue_mut(&mut self, handle: Handle) -> &mut ObjUpvalue {
        match self.get_mut(handle) {
            Obj::Upvalue(u) => u,
            other => panic!("expected upvalue, got {other:?}"),
        }
    }

    // ---------- Impression ----------

    /// Rend une valeur comme `print` la montre : `%g` pour les nombres, le
    /// contenu pour les chaînes, `<fn NOM>` / `<script>` pour les fonctions.
    pub fn value_to_string(&self, value: Value) -> String {
        if let Some(n) = value.as_number() {
            return fmt_g(n);
        }
        if value.is_nil() {
            return "nil".to_string();
        }
        if value == Value::TRUE {
            return "true".to_string();
        }
        if value == Value::FALSE {
            return "false".to_string();
        }
        match value.as_handle() {
            Some(handle) => match self.get(handle) {
                Obj::Str(s) => s.chars.to_string(),
                Obj::Fn(f) => self.function_name(f),
                Obj::Closure(c) => self.function_name(self.function(c.function)),
                Obj::Upvalue(_) => "upvalue".to_string(),
                Obj::Native(_) => "<native fn>".to_string(),
            },
            None => "nil".to_string(),
        }
    }

    fn function_name(&self, f: &ObjFn) -> String {
        match f.name {
            Some(name) => format!("<fn {}>", self.string(name).chars),
            None => "<script>".to_string(),
        }
    }

    // ---------- Collecte ----------

    /// Marque une valeur racine (sans effet sur les non-objets).
    pub fn mark_value(&mut self, value: Value) {
        if let Some(handle) = value.as_handle() {
            self.mark_object(handle);
        }
    }

    /// Marque un objet racine : pose le bit et l'empile sur la worklist
    /// grise s'il ne l'était pas déjà.
    pub fn mark_object(&mut self, handle: Handle) {
        if let Some(slot) = &mut self.slots[handle.index()] {
            if !slot.marked {
                slot.marked = true;
                self.gray.push(handle);
            }
        }
    }

    /// Collecte complète : marquage des racines, traçage, balayage faible
    /// de l'interneur, balayage de l'arène.
    pub fn collect(&mut self, roots: &dyn MarkRoots) {
        debug!("-- gc: début ({} octets)", self.bytes_allocated);
        let before = self.bytes_allocated;

        roots.mark_roots(self);
        self.trace_references();
        self.sweep_strings();
        self.sweep();

        self.next_gc = self.bytes_allocated * HEAP_GROW_FACTOR;
        debug!(
            "-- gc: fin ({} octets récupérés, prochain seuil {})",
            before - self.bytes_allocated,
            self.next_gc
        );
    }

    /// Draine la worklist grise en noircissant chaque objet : marquer tout
    /// ce qu'il référence.
    fn trace_references(&mut self) {
        while let Some(handle) = self.gray.pop() {
            self.blacken(handle);
        }
    }

    fn blacken(&mut self, handle: Handle) {
        // Rassembler d'abord les références sortantes, puis marquer : on ne
        // peut pas marquer (mutation) pendant qu'on lit l'objet.
        let mut outgoing: Vec<Handle> = Vec::new();
        match self.get(handle) {
            Obj::Str(_) | Obj::Native(_) => {}
            Obj::Upvalue(u) => {
                if let ObjUpvalue::Closed(v) = u {
                    if let Some(h) = v.as_handle() {
                        outgoing.push(h);
                    }
                }
            }
            Obj::Fn(f) => {
                if let Some(name) = f.name {
                    outgoing.push(name);
                }
                for constant in &f.chunk.constants {
                    if let Some(h) = constant.as_handle() {
                        outgoing.push(h);
                    }
                }
            }
            Obj::Closure(c) => {
                outgoing.push(c.function);
                outgoing.extend_from_slice(&c.upvalues);
            }
        }
        for h in outgoing {
            self.mark_object(h);
        }
    }

    /// Retire de l'interneur toute chaîne non marquée, pour que le balayage
    /// puisse la libérer.
    fn sweep_strings(&mut self) {
        let Heap { slots, strings, .. } = self;
        strings.remove_unmarked(|h| slots[h.index()].as_ref().is_some_and(|s| s.marked));
    }

    fn sweep(&mut self) {
        let Heap { slots, free, bytes_allocated, .. } = self;
        for (index, entry) in slots.iter_mut().enumerate() {
            match entry {
                Some(slot) if slot.marked => slot.marked = false,
                Some(slot) => {
                    trace!("free #{index} ({} octets)", slot.size);
                    *bytes_allocated -= slot.size;
                    *entry = None;
                    free.push(index as u32);
                }
                None => {}
            }
        }
    }

    /// Libère tous les objets (équivalent de `freeVM`). La comptabilité
    /// retombe à zéro.
    pub fn free_objects(&mut self) {
        self.strings.clear();
        self.gray.clear();
        self.collect(&NoRoots);
        debug_assert_eq!(self.bytes_allocated, 0);
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

/// FNV-1a 32 bits, le hachage des chaînes internées.
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_dedups() {
        let mut heap = Heap::new();
        let a = heap.intern("hop", &NoRoots);
        let b = heap.intern("hop", &NoRoots);
        let c = heap.intern("hip", &NoRoots);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(&*heap.string(a).chars, "hop");
        assert_eq!(heap.string(a).hash, fnv1a(b"hop"));
    }

    #[test]
    fn collect_frees_unreachable_and_accounting_reaches_zero() {
        let mut heap = Heap::new();
        heap.intern("perdue", &NoRoots);
        heap.intern("aussi perdue", &NoRoots);
        assert!(heap.bytes_allocated() > 0);
        assert_eq!(heap.object_count(), 2);

        heap.collect(&NoRoots);
        assert_eq!(heap.object_count(), 0);
        assert_eq!(heap.bytes_allocated(), 0);
    }

    #[test]
    fn roots_survive_and_marks_are_cleared() {
        struct OneRoot(Handle);
        impl MarkRoots for OneRoot {
            fn mark_roots(&self, heap: &mut Heap) {
                heap.mark_object(self.0);
            }
        }

        let mut heap = Heap::new();
        let kept = heap.intern("gardée", &NoRoots);
        heap.intern("perdue", &NoRoots);
        heap.collect(&OneRoot(kept));

        assert_eq!(heap.object_count(), 1);
        assert_eq!(&*heap.string(kept).chars, "gardée");
        // Le bit de marquage doit être retombé pour le cycle suivant.
        assert!(heap.slots[kept.index()].as_ref().is_some_and(|s| !s.marked));
        // La survivante est toujours internée : même contenu, même handle.
        let again = heap.intern("gardée", &NoRoots);
        assert_eq!(again, kept);
    }

    #[test]
    fn stress_mode_collects_on_every_alloc() {
        let mut heap = Heap::new();
        heap.set_stress(true);
        // Sans racine, chaque internement voit le précédent mourir.
        for i in 0..16 {
            heap.intern(&format!("s{i}"), &NoRoots);
        }
        assert!(heap.object_count() <= 1);
    }

    #[test]
    fn closures_keep_their_function_alive() {
        struct OneRoot(Handle);
        impl MarkRoots for OneRoot {
            fn mark_roots(&self, heap: &mut Heap) {
                heap.mark_object(self.0);
            }
        }

        let mut heap = Heap::new();
        let name = heap.intern("f", &NoRoots);
        let mut f = ObjFn::new();
        f.name = Some(name);
        let f_h = heap.alloc(Obj::Fn(f), &NoRoots);
        let closure = heap.alloc(
            Obj::Closure(ObjClosure { function: f_h, upvalues: Vec::new() }),
            &OneRoot(f_h),
        );

        heap.collect(&OneRoot(closure));
        assert_eq!(heap.object_count(), 3);
        assert_eq!(&*heap.string(name).chars, "f");
    }
}
