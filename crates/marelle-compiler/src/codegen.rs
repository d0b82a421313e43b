//! codegen.rs — Parser de Pratt et génération de bytecode, en une passe.
//!
//! Pas d'arbre intermédiaire : chaque règle de grammaire émet ses octets au
//! fil de la lecture. Une pile de [`FunctionBuilder`] matérialise les
//! compilations de fonctions imbriquées ; le dernier élément est la fonction
//! en cours, les précédents ses englobantes (le chaînage `parent` du schéma
//! classique).
//!
//! ## Compilateur et ramasse-miettes
//!
//! Les fonctions en construction vivent déjà dans le tas : chaque builder en
//! garde le handle et la chaîne entière sert de racine ([`BuilderRoots`]),
//! avec les noms de locales et les valeurs accrochées aux deux jetons du
//! parser. Toute allocation faite pendant la compilation (internements du
//! lexer, fonctions imbriquées) passe par cette racine, chaînée à celles que
//! la VM fournit.
//!
//! ## Cibles d'affectation
//!
//! `a = expr` n'est accepté que si la règle préfixe a été invoquée avec
//! `can_assign`, c'est-à-dire si la précédence d'entrée était inférieure ou
//! égale à `Assignment` : une question de contexte de précédence, pas de
//! syntaxe.

use ahash::AHashMap;
use log::debug;
use thiserror::Error;

use marelle_core::{Handle, Heap, MarkRoots, Obj, ObjFn, Op, Value};

use crate::lexer::{Lexer, Token, TokenKind};

/// Nombre maximal de locales par fonction (slots sur un octet).
pub const MAX_LOCALS: usize = 256;

/// Nombre maximal d'upvalues par fonction.
pub const MAX_UPVALUES: usize = 256;

/// Index de constante maximal pour les opérandes sur un octet.
const MAX_SHORT_CONSTANT: usize = 0xff;

/// Index de constante maximal pour `ConstantLong` (3 octets).
const MAX_LONG_CONSTANT: usize = 0xff_ffff;

/// Un diagnostic de compilation, avec sa ligne source.
#[derive(Debug, Clone, Error)]
#[error("[line {line}] error: {message}")]
pub struct CompileError {
    pub line: u32,
    pub message: String,
}

/// L'ensemble des diagnostics d'une compilation échouée.
#[derive(Debug)]
pub struct CompileErrors {
    pub diagnostics: Vec<CompileError>,
}

impl std::fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, diag) in self.diagnostics.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{diag}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileErrors {}

/// Niveaux de précédence, du plus lâche au plus serré.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Lowest,
    Assignment, // =
    Or,
    And,
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // ()
    Primary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FnKind {
    Script,
    Function,
}

/// Une locale : son nom interné, sa profondeur de portée (-1 tant que
/// l'initialiseur n'est pas compilé), et si une fermeture la capture.
struct Local {
    name: Handle,
    depth: i32,
    captured: bool,
}

/// Descripteur d'upvalue : index dans les locales du parent (`is_local`) ou
/// dans ses upvalues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpvalueDesc {
    pub index: u8,
    pub is_local: bool,
}

/// L'état de compilation d'une fonction. La fonction elle-même vit dans le
/// tas dès le départ, le builder n'en garde que le handle.
struct FunctionBuilder {
    function: Handle,
    kind: FnKind,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
    /// Offset du dernier opcode émis : la réécriture d'appel terminal ne
    /// doit jamais confondre un octet d'opérande avec un `Call`.
    last_op: Option<usize>,
    /// Dé-dupe des constantes objet (noms de globales surtout), pour rester
    /// dans la plage des index sur un octet.
    const_dedup: AHashMap<u64, usize>,
}

/// Racines GC du compilateur : la chaîne des fonctions en construction, les
/// noms de leurs locales, et les valeurs des deux jetons du parser. Chaîne
/// les racines de base (celles de la VM) par-dessus.
struct BuilderRoots<'a> {
    builders: &'a [FunctionBuilder],
    previous: &'a Token,
    current: &'a Token,
    base: &'a dyn MarkRoots,
}

impl MarkRoots for BuilderRoots<'_> {
    fn mark_roots(&self, heap: &mut Heap) {
        self.base.mark_roots(heap);
        heap.mark_value(self.previous.value);
        heap.mark_value(self.current.value);
        for builder in self.builders {
            heap.mark_object(builder.function);
            for local in &builder.locals {
                heap.mark_object(local.name);
            }
        }
    }
}

type ParseFn = fn(&mut Compiler, bool);

#[derive(Clone, Copy)]
struct Rule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

/// La table de grammaire : `(préfixe, infixe, précédence)` par jeton.
fn rule_for(kind: TokenKind) -> Rule {
    use TokenKind::*;
    let (prefix, infix, precedence): (Option<ParseFn>, Option<ParseFn>, Precedence) = match kind {
        LeftParen => (Some(grouping), Some(call), Precedence::Call),
        Minus => (Some(unary), Some(binary), Precedence::Term),
        Plus => (None, Some(binary), Precedence::Term),
        Slash | Star => (None, Some(binary), Precedence::Factor),
        Bang => (Some(unary), None, Precedence::None),
        BangEqual | EqualEqual => (None, Some(binary), Precedence::Equality),
        Greater | GreaterEqual | Less | LessEqual => {
            (None, Some(binary), Precedence::Comparison)
        }
        Identifier => (Some(variable), None, Precedence::None),
        Str => (Some(string), None, Precedence::None),
        Number => (Some(number), None, Precedence::None),
        False | Nil | True => (Some(literal), None, Precedence::None),
        _ => (None, None, Precedence::None),
    };
    Rule { prefix, infix, precedence }
}

/// Le compilateur : parser + générateur de code + pile de builders.
pub struct Compiler<'src, 'r> {
    lexer: Lexer<'src>,
    heap: &'r mut Heap,
    base_roots: &'r dyn MarkRoots,
    previous: Token,
    current: Token,
    builders: Vec<FunctionBuilder>,
    diagnostics: Vec<CompileError>,
    panic_mode: bool,
}

/// Compile `source` en une fonction script. `roots` racine les objets
/// persistants de l'appelant (globales de la VM, typiquement) pour les
/// collectes déclenchées pendant la compilation.
pub fn compile(
    source: &str,
    heap: &mut Heap,
    roots: &dyn MarkRoots,
) -> Result<Handle, CompileErrors> {
    let mut compiler = Compiler {
        lexer: Lexer::new(source),
        heap,
        base_roots: roots,
        previous: Token::placeholder(),
        current: Token::placeholder(),
        builders: Vec::new(),
        diagnostics: Vec::new(),
        panic_mode: false,
    };
    compiler.begin_builder(FnKind::Script, None);
    compiler.advance();
    while !compiler.matches(TokenKind::Eof) {
        compiler.declaration();
    }
    let (function, _) = compiler.end_builder();
    if compiler.diagnostics.is_empty() {
        debug!(
            "script compilé : {} octets de code",
            compiler.heap.function(function).chunk.len()
        );
        Ok(function)
    } else {
        Err(CompileErrors { diagnostics: compiler.diagnostics })
    }
}

impl Compiler<'_, '_> {
    // ---------- Lecture des jetons ----------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            let Compiler { lexer, heap, base_roots, previous, current, builders, .. } = self;
            let roots = BuilderRoots {
                builders: builders.as_slice(),
                previous: &*previous,
                current: &*current,
                base: *base_roots,
            };
            match lexer.next_token(heap, &roots) {
                Ok(token) => {
                    self.current = token;
                    return;
                }
                Err(e) => {
                    let (line, message) = (e.line, e.message);
                    self.error_at_line(line, message);
                }
            }
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    // ---------- Diagnostics ----------

    fn error_at_line(&mut self, line: u32, message: &str) {
        // En mode panique, on avale tout jusqu'à la resynchronisation.
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.diagnostics.push(CompileError { line, message: message.to_string() });
    }

    fn error(&mut self, message: &str) {
        let line = self.previous.line;
        self.error_at_line(line, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let line = self.current.line;
        self.error_at_line(line, message);
    }

    /// Resynchronisation après erreur : saute jusqu'à une frontière
    /// d'instruction plausible.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(TokenKind::Eof) {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => self.advance(),
            }
        }
    }

    // ---------- Builders de fonctions ----------

    fn builder(&self) -> &FunctionBuilder {
        self.builders.last().expect("builder chain empty")
    }

    fn builder_mut(&mut self) -> &mut FunctionBuilder {
        self.builders.last_mut().expect("builder chain empty")
    }

    fn chunk_len(&self) -> usize {
        self.heap.function(self.builder().function).chunk.len()
    }

    fn intern(&mut self, text: &str) -> Handle {
        let Compiler { heap, base_roots, previous, current, builders, .. } = self;
        let roots = BuilderRoots {
            builders: builders.as_slice(),
            previous: &*previous,
            current: &*current,
            base: *base_roots,
        };
        heap.intern(text, &roots)
    }

    /// Ouvre une compilation de fonction. La fonction est allouée dans le
    /// tas immédiatement : la chaîne des builders la racine dès maintenant.
    fn begin_builder(&mut self, kind: FnKind, name: Option<Token>) {
        let function = {
            let Compiler { heap, base_roots, previous, current, builders, .. } = self;
            let roots = BuilderRoots {
                builders: builders.as_slice(),
                previous: &*previous,
                current: &*current,
                base: *base_roots,
            };
            heap.alloc(Obj::Fn(ObjFn::new()), &roots)
        };
        self.builders.push(FunctionBuilder {
            function,
            kind,
            locals: Vec::new(),
            upvalues: Vec::new(),
            scope_depth: 0,
            last_op: None,
            const_dedup: AHashMap::new(),
        });
        if kind != FnKind::Script {
            self.heap.function_mut(function).name = name.and_then(|t| t.value.as_handle());
        }
        // Le slot 0 appartient à la fermeture appelée : nom vide, que le
        // programme ne peut pas prononcer.
        let empty = self.intern("");
        self.builder_mut().locals.push(Local { name: empty, depth: 0, captured: false });
    }

    /// Clôt la compilation courante : retour implicite, comptage des
    /// upvalues. Renvoie la fonction et ses descripteurs de capture.
    fn end_builder(&mut self) -> (Handle, Vec<UpvalueDesc>) {
        self.emit_return();
        let builder = self.builders.pop().expect("builder chain empty");
        self.heap.function_mut(builder.function).upvalue_count = builder.upvalues.len();
        (builder.function, builder.upvalues)
    }

    // ---------- Émission ----------

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        let function = self.builder().function;
        self.heap.function_mut(function).chunk.write(byte, line);
    }

    fn emit_op(&mut self, op: Op) {
        let offset = self.chunk_len();
        self.builder_mut().last_op = Some(offset);
        self.emit_byte(u8::from(op));
    }

    fn emit_ops(&mut self, op: Op, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    fn emit_return(&mut self) {
        self.emit_op(Op::Nil);
        self.emit_op(Op::Return);
    }

    fn make_constant(&mut self, value: Value) -> usize {
        if value.is_object() {
            if let Some(&index) = self.builder().const_dedup.get(&value.bits()) {
                return index;
            }
        }
        let function = self.builder().function;
        let index = self.heap.function_mut(function).chunk.add_constant(value);
        if value.is_object() {
            self.builder_mut().const_dedup.insert(value.bits(), index);
        }
        index
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        if index <= MAX_SHORT_CONSTANT {
            self.emit_ops(Op::Constant, index as u8);
        } else if index <= MAX_LONG_CONSTANT {
            self.emit_op(Op::ConstantLong);
            self.emit_byte((index & 0xff) as u8);
            self.emit_byte(((index >> 8) & 0xff) as u8);
            self.emit_byte(((index >> 16) & 0xff) as u8);
        } else {
            self.error("Too many constants in one chunk.");
        }
    }

    fn emit_jump(&mut self, op: Op) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk_len() - 2
    }

    /// Rétro-renseigne un saut avant : l'offset couvre tout ce qui a été
    /// émis depuis, en gros-boutiste sur 16 bits.
    fn patch_jump(&mut self, offset: usize) {
        let jump = self.chunk_len() - offset - 2;
        if jump > usize::from(u16::MAX) {
            self.error("Too much code to jump over.");
            return;
        }
        let function = self.builder().function;
        let code = &mut self.heap.function_mut(function).chunk.code;
        code[offset] = (jump >> 8) as u8;
        code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(Op::Loop);
        let offset = self.chunk_len() - loop_start + 2;
        if offset > usize::from(u16::MAX) {
            self.error("Loop body too large.");
        }
        self.emit_byte((offset >> 8) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    // ---------- Expressions ----------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Lowest);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = rule_for(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while rule_for(self.current.kind).precedence > precedence {
            self.advance();
            if let Some(infix) = rule_for(self.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u8 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == u8::MAX {
                    self.error("Can't have more than 255 arguments.");
                } else {
                    count += 1;
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count
    }

    // ---------- Résolution de variables ----------

    fn resolve_local(&mut self, builder_index: usize, name: Handle) -> Option<u8> {
        let found = self.builders[builder_index]
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, local)| local.name == name)
            .map(|(slot, local)| (slot, local.depth));
        match found {
            Some((slot, depth)) => {
                if depth == -1 {
                    self.error("Can't read local variable in its own initializer.");
                }
                Some(slot as u8)
            }
            None => None,
        }
    }

    /// Remonte la chaîne des builders : locale du parent (capturée), sinon
    /// upvalue du parent (transitif). Les doublons sont dé-dupliqués.
    fn resolve_upvalue(&mut self, builder_index: usize, name: Handle) -> Option<usize> {
        if builder_index == 0 {
            return None;
        }
        if let Some(slot) = self.resolve_local(builder_index - 1, name) {
            self.builders[builder_index - 1].locals[slot as usize].captured = true;
            return self.add_upvalue(builder_index, UpvalueDesc { index: slot, is_local: true });
        }
        if let Some(upvalue) = self.resolve_upvalue(builder_index - 1, name) {
            return self
                .add_upvalue(builder_index, UpvalueDesc { index: upvalue as u8, is_local: false });
        }
        None
    }

    fn add_upvalue(&mut self, builder_index: usize, desc: UpvalueDesc) -> Option<usize> {
        let builder = &self.builders[builder_index];
        if let Some(existing) = builder.upvalues.iter().position(|u| *u == desc) {
            return Some(existing);
        }
        if builder.upvalues.len() == MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return None;
        }
        self.builders[builder_index].upvalues.push(desc);
        Some(self.builders[builder_index].upvalues.len() - 1)
    }

    fn named_variable(&mut self, name: Token, can_assign: bool) {
        let Some(name_handle) = name.value.as_handle() else {
            self.error("Expect variable name.");
            return;
        };
        let top = self.builders.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(top, name_handle) {
            (Op::GetLocal, Op::SetLocal, usize::from(slot))
        } else if let Some(index) = self.resolve_upvalue(top, name_handle) {
            (Op::GetUpvalue, Op::SetUpvalue, index)
        } else {
            (Op::GetGlobal, Op::SetGlobal, self.make_constant(name.value))
        };
        if arg > MAX_SHORT_CONSTANT {
            self.error("Too many constants in one chunk.");
            return;
        }
        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_ops(set_op, arg as u8);
        } else {
            self.emit_ops(get_op, arg as u8);
        }
    }

    // ---------- Déclarations ----------

    fn declaration(&mut self) {
        if self.matches(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    /// Consomme l'identifiant. Pour une globale : index de son nom en
    /// constante ; pour une locale : slot réservé, profondeur -1.
    fn parse_variable(&mut self, message: &str) -> usize {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.builder().scope_depth > 0 {
            return 0;
        }
        let name = self.previous.value;
        self.make_constant(name)
    }

    fn declare_variable(&mut self) {
        if self.builder().scope_depth == 0 {
            return;
        }
        let Some(name) = self.previous.value.as_handle() else {
            return;
        };
        if self.builder().locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.builder_mut().locals.push(Local { name, depth: -1, captured: false });
    }

    fn mark_initialized(&mut self) {
        let builder = self.builder_mut();
        if builder.scope_depth == 0 {
            return;
        }
        let depth = builder.scope_depth;
        if let Some(local) = builder.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: usize) {
        if self.builder().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        if global > MAX_SHORT_CONSTANT {
            self.error("Too many constants in one chunk.");
            return;
        }
        self.emit_ops(Op::DefineGlobal, global as u8);
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(Op::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // Initialisée d'emblée : une fonction peut se nommer récursivement.
        self.mark_initialized();
        let name = self.previous;
        self.function(name);
        self.define_variable(global);
    }

    /// Compile `(params) { corps }` dans un builder imbriqué, puis émet
    /// `Closure` et les descripteurs de capture dans la fonction englobante.
    fn function(&mut self, name: Token) {
        self.begin_builder(FnKind::Function, Some(name));
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let function = self.builder().function;
                let arity = self.heap.function(function).arity;
                if arity == u8::MAX {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.heap.function_mut(function).arity = arity + 1;
                }
                let param = self.parse_variable("Expect parameter name.");
                self.define_variable(param);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();
        let (function, upvalues) = self.end_builder();
        // Pas d'allocation entre la clôture du builder et l'ajout de la
        // constante : le handle n'est plus raciné par la chaîne.
        let index = self.make_constant(Value::object(function));
        if index > MAX_SHORT_CONSTANT {
            self.error("Too many constants in one chunk.");
            return;
        }
        self.emit_ops(Op::Closure, index as u8);
        for upvalue in upvalues {
            self.emit_byte(u8::from(upvalue.is_local));
            self.emit_byte(upvalue.index);
        }
    }

    // ---------- Instructions ----------

    fn statement(&mut self) {
        if self.matches(TokenKind::Print) {
            self.print_statement();
        } else if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else {
            self.expression_statement();
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(Op::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(Op::Pop);
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn begin_scope(&mut self) {
        self.builder_mut().scope_depth += 1;
    }

    /// Ferme la portée : dépile chaque locale, par `Pop` si personne ne la
    /// capture, par `CloseUpvalue` sinon.
    fn end_scope(&mut self) {
        self.builder_mut().scope_depth -= 1;
        loop {
            let builder = self.builder();
            let Some(local) = builder.locals.last() else { break };
            if local.depth <= builder.scope_depth {
                break;
            }
            let captured = local.captured;
            self.builder_mut().locals.pop();
            if captured {
                self.emit_op(Op::CloseUpvalue);
            } else {
                self.emit_op(Op::Pop);
            }
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");
        let then_jump = self.emit_jump(Op::JumpIf);
        self.statement();
        if self.matches(TokenKind::Else) {
            let else_jump = self.emit_jump(Op::Jump);
            self.patch_jump(then_jump);
            self.statement();
            self.patch_jump(else_jump);
        } else {
            self.patch_jump(then_jump);
        }
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk_len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");
        let exit_jump = self.emit_jump(Op::JumpIf);
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
    }

    /// `return;` rend nil ; `return expr;` réécrit un `Call` final en
    /// `TailCall` (le frame de l'appelant sera réutilisé) et n'émet alors
    /// pas de `Return`.
    fn return_statement(&mut self) {
        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
            return;
        }
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after return value.");

        let len = self.chunk_len();
        let function = self.builder().function;
        let is_tail_call = self.builder().last_op.is_some_and(|offset| {
            offset + 2 == len
                && self.heap.function(function).chunk.code[offset] == u8::from(Op::Call)
        });
        if is_tail_call {
            self.heap.function_mut(function).chunk.code[len - 2] = u8::from(Op::TailCall);
        } else {
            self.emit_op(Op::Return);
        }
    }
}

// ---------- Règles de grammaire (fonctions libres de la table) ----------

fn grouping(c: &mut Compiler, _can_assign: bool) {
    c.expression();
    c.consume(TokenKind::RightParen, "Expect ')' after expression.");
}

fn number(c: &mut Compiler, _can_assign: bool) {
    let value = c.previous.value;
    c.emit_constant(value);
}

fn string(c: &mut Compiler, _can_assign: bool) {
    let value = c.previous.value;
    c.emit_constant(value);
}

fn literal(c: &mut Compiler, _can_assign: bool) {
    match c.previous.kind {
        TokenKind::False => c.emit_op(Op::False),
        TokenKind::Nil => c.emit_op(Op::Nil),
        TokenKind::True => c.emit_op(Op::True),
        _ => {}
    }
}

fn variable(c: &mut Compiler, can_assign: bool) {
    let name = c.previous;
    c.named_variable(name, can_assign);
}

fn unary(c: &mut Compiler, _can_assign: bool) {
    let kind = c.previous.kind;
    c.parse_precedence(Precedence::Unary);
    match kind {
        TokenKind::Minus => c.emit_op(Op::Negate),
        TokenKind::Bang => c.emit_op(Op::Not),
        _ => {}
    }
}

fn binary(c: &mut Compiler, _can_assign: bool) {
    let kind = c.previous.kind;
    let precedence = rule_for(kind).precedence;
    c.parse_precedence(precedence);
    match kind {
        TokenKind::Plus => c.emit_op(Op::Add),
        TokenKind::Minus => c.emit_op(Op::Subtract),
        TokenKind::Star => c.emit_op(Op::Multiply),
        TokenKind::Slash => c.emit_op(Op::Divide),
        TokenKind::Less => c.emit_op(Op::Less),
        TokenKind::Greater => c.emit_op(Op::Greater),
        TokenKind::EqualEqual => c.emit_op(Op::Equal),
        // Les formes composées : `a <= b` est `!(a > b)`, etc.
        TokenKind::LessEqual => {
            c.emit_op(Op::Greater);
            c.emit_op(Op::Not);
        }
        TokenKind::GreaterEqual => {
            c.emit_op(Op::Less);
            c.emit_op(Op::Not);
        }
        TokenKind::BangEqual => {
            c.emit_op(Op::Equal);
            c.emit_op(Op::Not);
        }
        _ => {}
    }
}

fn call(c: &mut Compiler, _can_assign: bool) {
    let count = c.argument_list();
    c.emit_ops(Op::Call, count);
}

#[cfg(test)]
mod tests {
    use super::*;
    use marelle_core::NoRoots;

    fn compile_ok(source: &str) -> (Heap, Handle) {
        let mut heap = Heap::new();
        let function = compile(source, &mut heap, &NoRoots).expect("compile ok");
        (heap, function)
    }

    fn code(heap: &Heap, function: Handle) -> Vec<u8> {
        heap.function(function).chunk.code.clone()
    }

    fn op(o: Op) -> u8 {
        u8::from(o)
    }

    #[test]
    fn arithmetic_respects_precedence() {
        // 1 + 2 * 3 : la multiplication se fait d'abord.
        let (heap, f) = compile_ok("print 1 + 2 * 3;");
        let chunk = &heap.function(f).chunk;
        assert_eq!(
            chunk.code,
            vec![
                op(Op::Constant), 0,
                op(Op::Constant), 1,
                op(Op::Constant), 2,
                op(Op::Multiply),
                op(Op::Add),
                op(Op::Print),
                op(Op::Nil),
                op(Op::Return),
            ]
        );
        assert_eq!(chunk.constants[0], Value::number(1.0));
        assert_eq!(chunk.constants[2], Value::number(3.0));
    }

    #[test]
    fn derived_comparisons_compose() {
        let (heap, f) = compile_ok("1 <= 2;");
        let bytes = code(&heap, f);
        let tail = &bytes[4..];
        assert_eq!(
            tail,
            [op(Op::Greater), op(Op::Not), op(Op::Pop), op(Op::Nil), op(Op::Return)]
        );
    }

    #[test]
    fn locals_resolve_to_slots_globals_to_names() {
        let (heap, f) = compile_ok("var g = 1; { var l = 2; l; } g;");
        let bytes = code(&heap, f);
        // La globale passe par DefineGlobal/GetGlobal, la locale par slot.
        assert!(bytes.contains(&op(Op::DefineGlobal)));
        assert!(bytes.contains(&op(Op::GetGlobal)));
        assert!(bytes.windows(2).any(|w| w == [op(Op::GetLocal), 1]));
    }

    #[test]
    fn repeated_global_names_share_one_constant() {
        let (heap, f) = compile_ok("var x = 1; x; x; x;");
        let constants = &heap.function(f).chunk.constants;
        let names = constants.iter().filter(|v| v.is_object()).count();
        assert_eq!(names, 1);
    }

    #[test]
    fn if_else_patches_jumps() {
        let (heap, f) = compile_ok("if (true) print 1; else print 2;");
        let bytes = code(&heap, f);
        assert_eq!(bytes[0], op(Op::True));
        assert_eq!(bytes[1], op(Op::JumpIf));
        // Le saut du then enjambe `print 1` + le Jump de sortie.
        let then_jump = usize::from(u16::from_be_bytes([bytes[2], bytes[3]]));
        let then_target = 4 + then_jump;
        assert_eq!(bytes[then_target - 3], op(Op::Jump));
        assert_eq!(bytes[then_target], op(Op::Constant));
    }

    #[test]
    fn while_loops_backwards() {
        let (heap, f) = compile_ok("while (false) print 1;");
        let bytes = code(&heap, f);
        let loop_pos = bytes.iter().position(|&b| b == op(Op::Loop)).expect("un Loop");
        let back = usize::from(u16::from_be_bytes([bytes[loop_pos + 1], bytes[loop_pos + 2]]));
        // Le saut arrière doit retomber pile sur le début de la condition.
        assert_eq!(loop_pos + 3 - back, 0);
    }

    #[test]
    fn closure_emits_upvalue_descriptors() {
        let (heap, f) = compile_ok(
            "fun make() { var c = 0; fun inc() { c = c + 1; return c; } return inc; }",
        );
        // `make` est la constante fonction du script (après son nom).
        let make = heap
            .function(f)
            .chunk
            .constants
            .iter()
            .filter_map(|v| v.as_handle())
            .find(|h| matches!(heap.get(*h), Obj::Fn(_)))
            .expect("fonction make");
        let make_fn = heap.function(make);
        // `inc` capture `c`, la locale 1 de `make`.
        let inc = make_fn
            .chunk
            .constants
            .iter()
            .filter_map(|v| v.as_handle())
            .find(|h| matches!(heap.get(*h), Obj::Fn(_)))
            .expect("fonction inc");
        assert_eq!(heap.function(inc).upvalue_count, 1);
        let bytes = &make_fn.chunk.code;
        let closure_pos =
            bytes.iter().position(|&b| b == op(Op::Closure)).expect("un Closure");
        // Descripteur (is_local=1, index=1) juste après l'opérande.
        assert_eq!(bytes[closure_pos + 2], 1);
        assert_eq!(bytes[closure_pos + 3], 1);
    }

    #[test]
    fn captured_local_closes_at_scope_exit() {
        let (heap, f) = compile_ok(
            "{ var a = 1; fun get() { return a; } get(); }",
        );
        let bytes = code(&heap, f);
        assert!(bytes.contains(&op(Op::CloseUpvalue)));
    }

    #[test]
    fn tail_calls_are_rewritten() {
        let (heap, f) = compile_ok("fun boucle(n) { return boucle(n - 1); }");
        let inner = heap
            .function(f)
            .chunk
            .constants
            .iter()
            .filter_map(|v| v.as_handle())
            .find(|h| matches!(heap.get(*h), Obj::Fn(_)))
            .expect("fonction boucle");
        let bytes = &heap.function(inner).chunk.code;
        assert!(bytes.contains(&op(Op::TailCall)));
        // Le TailCall est terminal : seuls le nil/return implicites suivent.
        let pos = bytes.iter().position(|&b| b == op(Op::TailCall)).expect("TailCall");
        assert_eq!(&bytes[pos + 2..], [op(Op::Nil), op(Op::Return)]);
    }

    #[test]
    fn operand_equal_to_call_byte_is_not_rewritten() {
        // `return a + b;` finit par Add : pas de réécriture, quel que soit
        // le contenu des octets d'opérande précédents.
        let (heap, f) = compile_ok("fun somme(a, b) { return a + b; }");
        let inner = heap
            .function(f)
            .chunk
            .constants
            .iter()
            .filter_map(|v| v.as_handle())
            .find(|h| matches!(heap.get(*h), Obj::Fn(_)))
            .expect("fonction somme");
        let bytes = &heap.function(inner).chunk.code;
        assert!(!bytes.contains(&op(Op::TailCall)));
        assert!(bytes.contains(&op(Op::Return)));
    }

    #[test]
    fn invalid_assignment_target_is_reported() {
        let mut heap = Heap::new();
        let err = compile("1 + 2 = 3;", &mut heap, &NoRoots).unwrap_err();
        assert!(err.to_string().contains("Invalid assignment target."));
    }

    #[test]
    fn missing_semicolon_is_reported_with_line() {
        let mut heap = Heap::new();
        let err = compile("print 1;\nprint 2", &mut heap, &NoRoots).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("[line 2]"), "{text}");
        assert!(text.contains("Expect ';'"), "{text}");
    }

    #[test]
    fn panic_mode_recovers_and_reports_later_errors() {
        let mut heap = Heap::new();
        let err = compile("var 1 = 2;\nvar y = ;\nprint y;", &mut heap, &NoRoots).unwrap_err();
        assert!(err.diagnostics.len() >= 2, "{err}");
    }

    #[test]
    fn reading_local_in_its_own_initializer_fails() {
        let mut heap = Heap::new();
        let err = compile("{ var a = a; }", &mut heap, &NoRoots).unwrap_err();
        assert!(err.to_string().contains("own initializer"));
    }

    #[test]
    fn compiles_under_gc_stress() {
        let mut heap = Heap::new();
        heap.set_stress(true);
        let function = compile(
            "fun make() { var c = 0; fun inc() { c = c + 1; return c; } return inc; } \
             var f = make(); print f();",
            &mut heap,
            &NoRoots,
        )
        .expect("compile ok");
        // La fonction script et ses constantes ont survécu aux collectes.
        assert!(!heap.function(function).chunk.code.is_empty());
    }
}
