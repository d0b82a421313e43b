//! natives.rs — Le petit stdlib hôte.
//!
//! Une seule native pour l'instant : `clock()`, secondes écoulées depuis le
//! démarrage du processus. Elle illustre le contrat des fonctions hôtes :
//! synchrone, pas d'allocation dans le tas, pas de ré-entrée dans la VM.

use std::time::Instant;

use once_cell::sync::Lazy;

use marelle_core::Value;

/// Origine des temps : le premier regard sur l'horloge.
static START: Lazy<Instant> = Lazy::new(Instant::now);

/// `clock()` -> nombre de secondes depuis le démarrage du processus.
pub fn clock(_args: &[Value]) -> Value {
    Value::number(START.elapsed().as_secs_f64())
}

/// Force l'initialisation de l'origine des temps.
pub(crate) fn init_clock() {
    Lazy::force(&START);
}
