/// Function prototype: compiled bytecode, constant pools, and debug info.
use crate::opcode::Instruction;
use khonsu_core::string::StringId;

/// How far back the number pool is scanned for duplicate literals.
/// Bounded on purpose: literals cluster, and an occasional duplicate
/// entry is cheaper than scanning the whole pool on every number.
pub const LOOKBACK_NUMS: usize = 20;

/// A local variable debug entry. A `None` name marks the point where a
/// variable went out of scope; the entry `(None, -1)` terminates the vector.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LocalVar {
    pub name: Option<StringId>,
    pub line: i32,
}

/// A compiled function prototype.
#[derive(Clone, Debug)]
pub struct Proto {
    /// Bytecode instructions.
    pub code: Vec<Instruction>,
    /// String constant pool.
    pub kstr: Vec<StringId>,
    /// Number constant pool.
    pub knum: Vec<f64>,
    /// Nested function prototypes.
    pub kproto: Vec<Proto>,
    /// Number of fixed parameters (an implicit `self` counts).
    pub num_params: u32,
    /// Whether this function accepts varargs.
    pub is_vararg: bool,
    /// Maximum operand-stack depth needed.
    pub max_stack_size: u32,
    /// Line of the `function` keyword; 0 for a main chunk.
    pub line_defined: u32,
    /// Source name (for error messages).
    pub source: Option<StringId>,
    /// Local variable debug info. `None` when debug info is disabled.
    pub locvars: Option<Vec<LocalVar>>,
}

impl Proto {
    /// Create a new empty prototype.
    pub fn new(debug_info: bool) -> Self {
        Proto {
            code: Vec::new(),
            kstr: Vec::new(),
            knum: Vec::new(),
            kproto: Vec::new(),
            num_params: 0,
            is_vararg: false,
            max_stack_size: 0,
            line_defined: 0,
            source: None,
            locvars: debug_info.then(Vec::new),
        }
    }

    /// Append an instruction, returning its pc.
    pub fn emit(&mut self, inst: Instruction) -> usize {
        let pc = self.code.len();
        self.code.push(inst);
        pc
    }

    /// Find or add a number constant, returning its index.
    ///
    /// Only the last [`LOOKBACK_NUMS`] entries are searched for a match.
    pub fn number_constant(&mut self, r: f64) -> usize {
        let n = self.knum.len();
        let lim = n.saturating_sub(LOOKBACK_NUMS);
        for c in (lim..n).rev() {
            if self.knum[c] == r {
                return c;
            }
        }
        self.knum.push(r);
        n
    }

    /// Get the number of instructions.
    pub fn code_len(&self) -> usize {
        self.code.len()
    }

    /// Get a mutable reference to an instruction (for backpatching).
    pub fn get_mut(&mut self, pc: usize) -> &mut Instruction {
        &mut self.code[pc]
    }

    /// Trim every growable vector to its used length.
    pub fn trim(&mut self) {
        self.code.shrink_to_fit();
        self.kstr.shrink_to_fit();
        self.knum.shrink_to_fit();
        self.kproto.shrink_to_fit();
        if let Some(locvars) = self.locvars.as_mut() {
            locvars.shrink_to_fit();
        }
    }
}
