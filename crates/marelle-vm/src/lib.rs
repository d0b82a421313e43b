//! marelle-vm — Machine virtuelle d'exécution du langage Marelle
//!
//! Interprète le bytecode produit par `marelle-compiler` : boucle de
//! dispatch `match` sur les opcodes, pile de valeurs, pile de frames
//! d'appel, upvalues ouverts, table des globales et fonctions natives.
//!
//! - Le tas ([`marelle_core::Heap`]) appartient à la VM ; la pile, les
//!   frames, les globales et la liste des upvalues ouverts forment ses
//!   racines GC, déclarées au collecteur à chaque allocation.
//! - Les sorties de `print` passent par le trait [`Host`], remplaçable pour
//!   les tests.
//! - `TailCall` réutilise le frame courant : la récursion terminale tourne
//!   en profondeur de pile bornée.
//!
//! ### Exemple
//!
//! ```
//! use marelle_vm::{Vm, VmOptions};
//!
//! let mut vm = Vm::with_options(VmOptions::default());
//! vm.interpret("print 1 + 2 * 3;").expect("exécution ok");
//! ```

use log::warn;
use thiserror::Error;

use marelle_core::bytecode::disasm;
use marelle_core::{
    Handle, Heap, MarkRoots, NativeFn, Obj, ObjClosure, ObjNative, ObjUpvalue, Op, Table, Value,
};
use marelle_compiler::{compile, CompileErrors};

pub mod natives;

/// Profondeur maximale de la pile d'appels.
pub const FRAMES_MAX: usize = 64;

/// Capacité de la pile de valeurs.
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// Environnement hôte : là où `print` écrit.
pub trait Host {
    /// Imprime une ligne complète (le retour final est ajouté par l'hôte).
    fn print_line(&mut self, text: &str);
}

/// Hôte par défaut : stdout.
#[derive(Default)]
pub struct DefaultHost;

impl Host for DefaultHost {
    fn print_line(&mut self, text: &str) {
        println!("{text}");
    }
}

/// Options de construction de la VM.
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Trace chaque instruction exécutée (via `log::trace!`).
    pub trace: bool,
    /// Force une collecte avant chaque allocation (mode test).
    pub gc_stress: bool,
    /// Installe le stdlib natif (`clock`).
    pub stdlib: bool,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self { trace: false, gc_stress: false, stdlib: true }
    }
}

impl VmOptions {
    /// Active/désactive la trace d'exécution.
    pub fn with_trace(mut self, on: bool) -> Self {
        self.trace = on;
        self
    }

    /// Active/désactive le stress GC.
    pub fn with_gc_stress(mut self, on: bool) -> Self {
        self.gc_stress = on;
        self
    }

    /// Active/désactive le stdlib natif.
    pub fn with_stdlib(mut self, on: bool) -> Self {
        self.stdlib = on;
        self
    }
}

/// Erreur d'exécution : message, ligne fautive, remontée d'appels.
#[derive(Debug)]
pub struct RuntimeError {
    pub message: String,
    pub line: u32,
    pub trace: Vec<String>,
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[line {}] runtime error: {}", self.line, self.message)?;
        for entry in &self.trace {
            write!(f, "\n{entry}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// Résultat d'un `interpret` : compilation ou exécution peuvent échouer.
#[derive(Debug, Error)]
pub enum InterpretError {
    #[error(transparent)]
    Compile(#[from] CompileErrors),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Un frame d'appel : la fermeture exécutée, son compteur d'instructions,
/// et la base de ses slots sur la pile de valeurs (le slot 0 est la
/// fermeture elle-même).
struct CallFrame {
    closure: Handle,
    ip: usize,
    slots: usize,
}

/// Racines GC de la VM, empruntées champ à champ pour laisser le tas libre.
struct VmRoots<'a> {
    stack: &'a [Value],
    frames: &'a [CallFrame],
    globals: &'a Table,
    open_upvalues: &'a [Handle],
}

impl MarkRoots for VmRoots<'_> {
    fn mark_roots(&self, heap: &mut Heap) {
        for &value in self.stack {
            heap.mark_value(value);
        }
        for frame in self.frames {
            heap.mark_object(frame.closure);
        }
        for (key, value) in self.globals.iter() {
            heap.mark_object(key);
            heap.mark_value(value);
        }
        for &upvalue in self.open_upvalues {
            heap.mark_object(upvalue);
        }
    }
}

/// La machine virtuelle.
pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    /// Upvalues ouverts, triés par slot strictement décroissant ; au plus
    /// un par slot de pile.
    open_upvalues: Vec<Handle>,
    host: Box<dyn Host>,
    options: VmOptions,
}

impl Vm {
    /// VM avec options par défaut.
    pub fn new() -> Vm {
        Vm::with_options(VmOptions::default())
    }

    /// VM configurée.
    pub fn with_options(options: VmOptions) -> Vm {
        let mut heap = Heap::new();
        heap.set_stress(options.gc_stress);
        let mut vm = Vm {
            heap,
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            host: Box::new(DefaultHost),
            options,
        };
        if vm.options.stdlib {
            natives::init_clock();
            if let Err(e) = vm.define_native("clock", natives::clock) {
                warn!("stdlib: {e}");
            }
        }
        vm
    }

    /// Remplace l'hôte (les tests y branchent un collecteur de lignes).
    pub fn with_host(mut self, host: Box<dyn Host>) -> Self {
        self.host = host;
        self
    }

    /// Le tas, en lecture.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Lit une globale par son nom (introspection, tests).
    pub fn get_global(&self, name: &str) -> Option<Value> {
        let handle = self.heap.lookup_interned(name)?;
        let hash = self.heap.string(handle).hash;
        self.globals.get(handle, hash)
    }

    /// Enregistre une fonction native sous `name`. Le nom et l'objet natif
    /// restent sur la pile pendant l'insertion : une collecte déclenchée
    /// par l'une des allocations les voit comme racines.
    pub fn define_native(
        &mut self,
        name: &'static str,
        function: NativeFn,
    ) -> Result<(), RuntimeError> {
        let name_handle = self.intern(name);
        self.push(Value::object(name_handle))?;
        let native = self.alloc(Obj::Native(ObjNative { name, function }));
        self.push(Value::object(native))?;
        let hash = self.heap.string(name_handle).hash;
        self.globals.set(name_handle, hash, Value::object(native));
        self.pop();
        self.pop();
        Ok(())
    }

    /// Compile puis exécute `source`. En cas d'erreur d'exécution, la pile
    /// est remise à zéro avant de rendre la main : la VM reste utilisable.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function = {
            let Vm { heap, stack, frames, globals, open_upvalues, .. } = self;
            let roots = VmRoots {
                stack: stack.as_slice(),
                frames: frames.as_slice(),
                globals: &*globals,
                open_upvalues: open_upvalues.as_slice(),
            };
            compile(source, heap, &roots)?
        };
        let result = self.run_function(function);
        if result.is_err() {
            self.reset_stack();
        }
        result.map_err(Into::into)
    }

    // ---------- Allocation racinée ----------

    fn alloc(&mut self, obj: Obj) -> Handle {
        let Vm { heap, stack, frames, globals, open_upvalues, .. } = self;
        let roots = VmRoots {
            stack: stack.as_slice(),
            frames: frames.as_slice(),
            globals: &*globals,
            open_upvalues: open_upvalues.as_slice(),
        };
        heap.alloc(obj, &roots)
    }

    fn intern(&mut self, text: &str) -> Handle {
        let Vm { heap, stack, frames, globals, open_upvalues, .. } = self;
        let roots = VmRoots {
            stack: stack.as_slice(),
            frames: frames.as_slice(),
            globals: &*globals,
            open_upvalues: open_upvalues.as_slice(),
        };
        heap.intern(text, &roots)
    }

    // ---------- Pile ----------

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack.len() == STACK_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    fn peek(&self, depth: usize) -> Value {
        self.stack[self.stack.len() - 1 - depth]
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    // ---------- Frames ----------

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active call frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active call frame")
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frame();
        let (closure, ip) = (frame.closure, frame.ip);
        let byte = {
            let function = self.heap.closure(closure).function;
            self.heap.function(function).chunk.code[ip]
        };
        self.frame_mut().ip = ip + 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        u16::from_be_bytes([hi, lo])
    }

    fn read_constant(&self, index: usize) -> Value {
        let closure = self.frame().closure;
        let function = self.heap.closure(closure).function;
        self.heap.function(function).chunk.constants[index]
    }

    /// Lit l'opérande nom-de-globale : une constante chaîne et son hachage.
    fn read_global_name(&mut self) -> (Handle, u32) {
        let index = self.read_byte() as usize;
        let name = self.read_constant(index).as_handle().expect("global name constant");
        let hash = self.heap.string(name).hash;
        (name, hash)
    }

    fn current_line(&self) -> u32 {
        match self.frames.last() {
            Some(frame) => {
                let closure = self.heap.closure(frame.closure);
                let chunk = &self.heap.function(closure.function).chunk;
                chunk.lines.line_at(frame.ip.saturating_sub(1) as u32).unwrap_or(0)
            }
            None => 0,
        }
    }

    fn runtime_error(&self, message: impl Into<String>) -> RuntimeError {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let closure = self.heap.closure(frame.closure);
            let function = self.heap.function(closure.function);
            let line =
                function.chunk.lines.line_at(frame.ip.saturating_sub(1) as u32).unwrap_or(0);
            let name = match function.name {
                Some(n) => format!("{}()", self.heap.string(n).chars),
                None => "script".to_string(),
            };
            trace.push(format!("[line {line}] in {name}"));
        }
        RuntimeError { message: message.into(), line: self.current_line(), trace }
    }

    // ---------- Appels ----------

    fn run_function(&mut self, function: Handle) -> Result<(), RuntimeError> {
        // La fonction script reste sur la pile pendant l'allocation de sa
        // fermeture : point-sûr GC.
        self.push(Value::object(function))?;
        let closure =
            self.alloc(Obj::Closure(ObjClosure { function, upvalues: Vec::new() }));
        self.pop();
        self.push(Value::object(closure))?;
        self.call_value(Value::object(closure), 0)?;
        self.run()
    }

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), RuntimeError> {
        if let Some(handle) = callee.as_handle() {
            match self.heap.get(handle) {
                Obj::Closure(_) => return self.call(handle, arg_count),
                Obj::Native(native) => {
                    let function = native.function;
                    let start = self.stack.len() - arg_count;
                    let result = function(&self.stack[start..]);
                    self.stack.truncate(start - 1);
                    return self.push(result);
                }
                _ => {}
            }
        }
        Err(self.runtime_error("Can only call functions."))
    }

    fn call(&mut self, closure: Handle, arg_count: usize) -> Result<(), RuntimeError> {
        let arity = {
            let c = self.heap.closure(closure);
            usize::from(self.heap.function(c.function).arity)
        };
        if arg_count != arity {
            return Err(
                self.runtime_error(format!("Expected {arity} arguments but got {arg_count}."))
            );
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slots: self.stack.len() - arg_count - 1,
        });
        Ok(())
    }

    /// Sortie de frame commune à `Return` et aux appels terminaux vers une
    /// native. Renvoie `true` quand le script est terminé.
    fn do_return(&mut self) -> Result<bool, RuntimeError> {
        let result = self.pop();
        let frame = self.frames.pop().expect("no active call frame");
        self.close_upvalues(frame.slots);
        if self.frames.is_empty() {
            // Il ne reste que la fermeture du script.
            self.pop();
            debug_assert!(self.stack.is_empty());
            return Ok(true);
        }
        self.stack.truncate(frame.slots);
        self.push(result)?;
        Ok(false)
    }

    /// `TailCall` : le frame courant est réutilisé par l'appelé. Les
    /// upvalues du frame abandonné se ferment d'abord, comme l'aurait fait
    /// le `Return` équivalent.
    fn tail_call(&mut self, arg_count: usize) -> Result<bool, RuntimeError> {
        let callee = self.peek(arg_count);
        let Some(handle) = callee.as_handle() else {
            return Err(self.runtime_error("Can only call functions."));
        };
        match self.heap.get(handle) {
            Obj::Closure(_) => {}
            Obj::Native(native) => {
                // Même comportement observable que Call suivi de Return.
                let function = native.function;
                let start = self.stack.len() - arg_count;
                let result = function(&self.stack[start..]);
                self.stack.truncate(start - 1);
                self.push(result)?;
                return self.do_return();
            }
            _ => return Err(self.runtime_error("Can only call functions.")),
        }

        let arity = {
            let c = self.heap.closure(handle);
            usize::from(self.heap.function(c.function).arity)
        };
        if arg_count != arity {
            return Err(
                self.runtime_error(format!("Expected {arity} arguments but got {arg_count}."))
            );
        }
        let slots = self.frame().slots;
        self.close_upvalues(slots);
        // Rabat `[appelé, args…]` sur la base du frame, slots [0..=argc].
        let from = self.stack.len() - arg_count - 1;
        for i in 0..=arg_count {
            self.stack[slots + i] = self.stack[from + i];
        }
        self.stack.truncate(slots + arg_count + 1);
        let frame = self.frame_mut();
        frame.closure = handle;
        frame.ip = 0;
        Ok(false)
    }

    // ---------- Upvalues ----------

    fn open_slot(&self, upvalue: Handle) -> usize {
        match *self.heap.upvalue(upvalue) {
            ObjUpvalue::Open(slot) => slot,
            ObjUpvalue::Closed(_) => panic!("closed upvalue in the open list"),
        }
    }

    /// Capture le slot `slot` : réutilise l'upvalue ouvert existant s'il y
    /// en a un, sinon en crée un et l'insère à sa place dans la liste triée.
    fn capture_upvalue(&mut self, slot: usize) -> Handle {
        let mut index = 0;
        while index < self.open_upvalues.len() {
            let open = self.open_slot(self.open_upvalues[index]);
            if open <= slot {
                if open == slot {
                    return self.open_upvalues[index];
                }
                break;
            }
            index += 1;
        }
        // Le nouvel upvalue entre dans la liste ouverte aussitôt : c'est
        // elle qui le racine jusqu'à sa fermeture.
        let created = self.alloc(Obj::Upvalue(ObjUpvalue::Open(slot)));
        self.open_upvalues.insert(index, created);
        created
    }

    /// Ferme tous les upvalues ouverts dont le slot est ≥ `last` : la
    /// valeur est recopiée dans l'upvalue, qui quitte la liste ouverte.
    fn close_upvalues(&mut self, last: usize) {
        let mut closed = 0;
        while closed < self.open_upvalues.len() {
            let handle = self.open_upvalues[closed];
            let slot = self.open_slot(handle);
            if slot < last {
                break;
            }
            let value = self.stack[slot];
            *self.heap.upvalue_mut(handle) = ObjUpvalue::Closed(value);
            closed += 1;
        }
        self.open_upvalues.drain(..closed);
    }

    // ---------- Boucle de dispatch ----------

    fn binary_num(
        &mut self,
        op: impl FnOnce(f64, f64) -> Value,
    ) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => self.push(op(x, y)),
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    fn trace_instruction(&self) {
        let frame = self.frame();
        let closure = self.heap.closure(frame.closure);
        let chunk = &self.heap.function(closure.function).chunk;
        let rendered: Vec<String> =
            self.stack.iter().map(|&v| self.heap.value_to_string(v)).collect();
        log::trace!("pile : [{}]", rendered.join(" | "));
        let (text, _) = disasm::disassemble_at(&self.heap, chunk, frame.ip);
        log::trace!("{text}");
    }

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if self.options.trace {
                self.trace_instruction();
            }
            let byte = self.read_byte();
            let op = Op::try_from(byte)
                .map_err(|_| self.runtime_error(format!("Unknown opcode 0x{byte:02x}.")))?;
            match op {
                Op::Constant => {
                    let index = self.read_byte() as usize;
                    let value = self.read_constant(index);
                    self.push(value)?;
                }
                Op::ConstantLong => {
                    // Index 24 bits, petit-boutiste.
                    let b0 = self.read_byte() as usize;
                    let b1 = self.read_byte() as usize;
                    let b2 = self.read_byte() as usize;
                    let value = self.read_constant(b0 | b1 << 8 | b2 << 16);
                    self.push(value)?;
                }
                Op::Nil => self.push(Value::NIL)?,
                Op::True => self.push(Value::TRUE)?,
                Op::False => self.push(Value::FALSE)?,
                Op::Pop => {
                    self.pop();
                }
                Op::Add => self.binary_num(|a, b| Value::number(a + b))?,
                Op::Subtract => self.binary_num(|a, b| Value::number(a - b))?,
                Op::Multiply => self.binary_num(|a, b| Value::number(a * b))?,
                Op::Divide => self.binary_num(|a, b| Value::number(a / b))?,
                Op::Less => self.binary_num(|a, b| Value::boolean(a < b))?,
                Op::Greater => self.binary_num(|a, b| Value::boolean(a > b))?,
                Op::Negate => {
                    let value = self.pop();
                    match value.as_number() {
                        Some(n) => self.push(Value::number(-n))?,
                        None => return Err(self.runtime_error("Operand must be a number.")),
                    }
                }
                Op::Not => {
                    let value = self.pop();
                    self.push(Value::boolean(value.is_falsey()))?;
                }
                Op::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::boolean(a.equals(b)))?;
                }
                Op::Print => {
                    let value = self.pop();
                    let text = self.heap.value_to_string(value);
                    self.host.print_line(&text);
                }
                Op::DefineGlobal => {
                    let (name, hash) = self.read_global_name();
                    // La valeur reste visible sur la pile pendant
                    // l'insertion, puis seulement est dépilée.
                    let value = self.peek(0);
                    self.globals.set(name, hash, value);
                    self.pop();
                }
                Op::GetGlobal => {
                    let (name, hash) = self.read_global_name();
                    match self.globals.get(name, hash) {
                        Some(value) => self.push(value)?,
                        None => {
                            let text = self.heap.string(name).chars.to_string();
                            return Err(
                                self.runtime_error(format!("Undefined variable '{text}'."))
                            );
                        }
                    }
                }
                Op::SetGlobal => {
                    let (name, hash) = self.read_global_name();
                    let value = self.peek(0);
                    if self.globals.set(name, hash, value) {
                        // Affecter une globale inconnue ne doit pas la
                        // créer : on retire l'entrée fraîche avant l'erreur.
                        self.globals.delete(name, hash);
                        let text = self.heap.string(name).chars.to_string();
                        return Err(self.runtime_error(format!("Undefined variable '{text}'.")));
                    }
                }
                Op::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let value = self.stack[self.frame().slots + slot];
                    self.push(value)?;
                }
                Op::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().slots;
                    self.stack[base + slot] = self.peek(0);
                }
                Op::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let closure = self.frame().closure;
                    let upvalue = self.heap.closure(closure).upvalues[index];
                    let value = match *self.heap.upvalue(upvalue) {
                        ObjUpvalue::Open(slot) => self.stack[slot],
                        ObjUpvalue::Closed(value) => value,
                    };
                    self.push(value)?;
                }
                Op::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let closure = self.frame().closure;
                    let upvalue = self.heap.closure(closure).upvalues[index];
                    let value = self.peek(0);
                    match *self.heap.upvalue(upvalue) {
                        ObjUpvalue::Open(slot) => self.stack[slot] = value,
                        ObjUpvalue::Closed(_) => {
                            *self.heap.upvalue_mut(upvalue) = ObjUpvalue::Closed(value);
                        }
                    }
                }
                Op::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                Op::JumpIf => {
                    let offset = usize::from(self.read_u16());
                    let condition = self.pop();
                    if condition.is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                Op::Jump => {
                    let offset = usize::from(self.read_u16());
                    self.frame_mut().ip += offset;
                }
                Op::Loop => {
                    let offset = usize::from(self.read_u16());
                    self.frame_mut().ip -= offset;
                }
                Op::Call => {
                    let arg_count = self.read_byte() as usize;
                    let callee = self.peek(arg_count);
                    self.call_value(callee, arg_count)?;
                }
                Op::TailCall => {
                    let arg_count = self.read_byte() as usize;
                    if self.tail_call(arg_count)? {
                        return Ok(());
                    }
                }
                Op::Closure => {
                    let index = self.read_byte() as usize;
                    let function =
                        self.read_constant(index).as_handle().expect("closure constant");
                    let upvalue_count = self.heap.function(function).upvalue_count;
                    let closure = self.alloc(Obj::Closure(ObjClosure {
                        function,
                        upvalues: Vec::with_capacity(upvalue_count),
                    }));
                    // Empilée avant le remplissage : capturer peut allouer,
                    // donc collecter.
                    self.push(Value::object(closure))?;
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let slot = self.frame().slots + index;
                            self.capture_upvalue(slot)
                        } else {
                            let parent = self.frame().closure;
                            self.heap.closure(parent).upvalues[index]
                        };
                        self.heap.closure_mut(closure).upvalues.push(upvalue);
                    }
                }
                Op::Return => {
                    if self.do_return()? {
                        return Ok(());
                    }
                }
            }
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
