// Symbol tables: word <-> id and knowledge-type <-> id, with total lookups.

use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Reserved ids
// ---------------------------------------------------------------------------

pub const PAD_ID: u32 = 0;
pub const UNK_ID: u32 = 1;
pub const GO_ID: u32 = 2;
pub const EOS_ID: u32 = 3;
pub const NONE_ID: u32 = 0;

pub const PAD_SYMBOL: &str = "_PAD";
pub const UNK_SYMBOL: &str = "_UNK";
pub const GO_SYMBOL: &str = "_GO";
pub const EOS_SYMBOL: &str = "_EOS";
pub const NONE_SYMBOL: &str = "_NONE";

// ---------------------------------------------------------------------------
// SymbolTable
// ---------------------------------------------------------------------------

/// Bidirectional string/id table indexed by list position.
/// Misses resolve to the table's default id or default symbol.
#[derive(Clone, Debug)]
pub struct SymbolTable {
    symbols: Vec<String>,
    sym2id: HashMap<String, u32>,
    default_id: u32,
    default_symbol: &'static str,
}

impl SymbolTable {
    pub fn new(symbols: &[String], default_id: u32, default_symbol: &'static str) -> Self {
        let mut sym2id = HashMap::with_capacity(symbols.len());
        for (i, s) in symbols.iter().enumerate() {
            sym2id.insert(s.clone(), i as u32);
        }
        Self {
            symbols: symbols.to_vec(),
            sym2id,
            default_id,
            default_symbol,
        }
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn id(&self, symbol: &str) -> u32 {
        self.sym2id.get(symbol).copied().unwrap_or(self.default_id)
    }

    pub fn symbol(&self, id: u32) -> &str {
        self.symbols
            .get(id as usize)
            .map(|s| s.as_str())
            .unwrap_or(self.default_symbol)
    }

    pub fn ids<S: AsRef<str>>(&self, symbols: &[S]) -> Vec<u32> {
        symbols.iter().map(|s| self.id(s.as_ref())).collect()
    }
}

// ---------------------------------------------------------------------------
// Vocabularies
// ---------------------------------------------------------------------------

/// Word and knowledge-type tables, populated together by `set_vocabs`.
#[derive(Clone, Debug)]
pub struct Vocabularies {
    pub words: SymbolTable,
    pub kd: SymbolTable,
}

impl Vocabularies {
    pub fn new(words: &[String], kd_types: &[String]) -> Self {
        Self {
            words: SymbolTable::new(words, UNK_ID, UNK_SYMBOL),
            kd: SymbolTable::new(kd_types, NONE_ID, NONE_SYMBOL),
        }
    }
}

/// Prepend the reserved symbols to a word list, skipping duplicates of them.
pub fn with_reserved_symbols<S: AsRef<str>>(words: &[S]) -> Vec<String> {
    let reserved = [PAD_SYMBOL, UNK_SYMBOL, GO_SYMBOL, EOS_SYMBOL];
    let mut out: Vec<String> = reserved.iter().map(|s| s.to_string()).collect();
    out.extend(
        words
            .iter()
            .map(|w| w.as_ref())
            .filter(|w| !reserved.contains(w))
            .map(str::to_string),
    );
    out
}
