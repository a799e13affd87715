use serde_json::Value;

use crate::store::{
    get_bool, get_hex, get_int, get_str, set_bool, set_hex, set_int, set_str, EntryPayload,
    EntryStore, JsonObject, MAX_COMMENT_SIZE, MAX_LABEL_SIZE, RESERVED_DELIMITER,
};

pub type Comments = EntryStore<Comment>;
pub type Labels = EntryStore<Label>;
pub type Bookmarks = EntryStore<Bookmark>;
pub type Functions = EntryStore<Function>;
pub type Arguments = EntryStore<Argument>;
pub type Loops = EntryStore<LoopBracket>;
pub type Xrefs = EntryStore<Xref>;
pub type Watches = EntryStore<Watch>;
pub type EncodeMaps = EntryStore<EncodeMap>;
pub type Breakpoints = EntryStore<Breakpoint>;

fn valid_text(text: &str, max: usize) -> bool {
    !text.is_empty() && text.len() < max && !text.contains(RESERVED_DELIMITER)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comment {
    pub text: String,
}

impl Comment {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

impl EntryPayload for Comment {
    const JSON_KEY: &'static str = "comments";
    const LEGACY_KEY: Option<&'static str> = Some("autocomments");

    fn save(&self, obj: &mut JsonObject) {
        set_str(obj, "text", &self.text);
    }

    fn load(obj: &JsonObject) -> Option<Self> {
        Some(Self {
            text: get_str(obj, "text")?.to_string(),
        })
    }

    fn validate(&self, _rva: u64) -> bool {
        valid_text(&self.text, MAX_COMMENT_SIZE)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Label {
    pub text: String,
}

impl Label {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

impl EntryPayload for Label {
    const JSON_KEY: &'static str = "labels";
    const LEGACY_KEY: Option<&'static str> = Some("autolabels");

    fn save(&self, obj: &mut JsonObject) {
        set_str(obj, "text", &self.text);
    }

    fn load(obj: &JsonObject) -> Option<Self> {
        Some(Self {
            text: get_str(obj, "text")?.to_string(),
        })
    }

    fn validate(&self, _rva: u64) -> bool {
        valid_text(&self.text, MAX_LABEL_SIZE)
    }
}

/// A bookmark is bare presence at an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bookmark;

impl EntryPayload for Bookmark {
    const JSON_KEY: &'static str = "bookmarks";
    const LEGACY_KEY: Option<&'static str> = Some("autobookmarks");

    fn save(&self, _obj: &mut JsonObject) {}

    fn load(_obj: &JsonObject) -> Option<Self> {
        Some(Self)
    }
}

/// Function bracket. The anchor RVA is the function start; `end` is the
/// inclusive last-instruction RVA within the same module.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub end: u64,
    pub icount: u64,
}

impl EntryPayload for Function {
    const JSON_KEY: &'static str = "functions";
    const LEGACY_KEY: Option<&'static str> = Some("autofunctions");
    const ADDRESS_FIELD: &'static str = "start";

    fn save(&self, obj: &mut JsonObject) {
        set_hex(obj, "end", self.end);
        set_hex(obj, "icount", self.icount);
    }

    fn load(obj: &JsonObject) -> Option<Self> {
        Some(Self {
            end: get_hex(obj, "end")?,
            icount: get_hex(obj, "icount").unwrap_or(0),
        })
    }

    fn validate(&self, rva: u64) -> bool {
        self.end >= rva
    }
}

/// Argument window of a call site, bracketed like a function.
#[derive(Debug, Clone, PartialEq)]
pub struct Argument {
    pub end: u64,
    pub icount: u64,
}

impl EntryPayload for Argument {
    const JSON_KEY: &'static str = "arguments";
    const LEGACY_KEY: Option<&'static str> = Some("autoarguments");
    const ADDRESS_FIELD: &'static str = "start";

    fn save(&self, obj: &mut JsonObject) {
        set_hex(obj, "end", self.end);
        set_hex(obj, "icount", self.icount);
    }

    fn load(obj: &JsonObject) -> Option<Self> {
        Some(Self {
            end: get_hex(obj, "end")?,
            icount: get_hex(obj, "icount").unwrap_or(0),
        })
    }

    fn validate(&self, rva: u64) -> bool {
        self.end >= rva
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopBracket {
    pub end: u64,
    pub parent: u64,
    pub depth: u32,
}

impl EntryPayload for LoopBracket {
    const JSON_KEY: &'static str = "loops";
    const LEGACY_KEY: Option<&'static str> = Some("autoloops");
    const ADDRESS_FIELD: &'static str = "start";

    fn save(&self, obj: &mut JsonObject) {
        set_hex(obj, "end", self.end);
        set_hex(obj, "parent", self.parent);
        set_int(obj, "depth", self.depth as u64);
    }

    fn load(obj: &JsonObject) -> Option<Self> {
        Some(Self {
            end: get_hex(obj, "end")?,
            parent: get_hex(obj, "parent").unwrap_or(0),
            depth: get_int(obj, "depth").unwrap_or(0) as u32,
        })
    }

    fn validate(&self, rva: u64) -> bool {
        self.end >= rva
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XrefKind {
    Data,
    Jmp,
    Call,
}

#[derive(Debug, Clone, PartialEq)]
pub struct XrefRecord {
    /// RVA of the referencing instruction, same module as the target.
    pub rva: u64,
    pub kind: XrefKind,
}

/// All references *to* the anchor address.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Xref {
    pub references: Vec<XrefRecord>,
}

impl Xref {
    pub fn jmp_count(&self) -> usize {
        self.references.iter().filter(|r| r.kind == XrefKind::Jmp).count()
    }

    pub fn call_count(&self) -> usize {
        self.references.iter().filter(|r| r.kind == XrefKind::Call).count()
    }
}

impl EntryPayload for Xref {
    const JSON_KEY: &'static str = "xrefs";

    fn save(&self, obj: &mut JsonObject) {
        set_hex(obj, "jmp_count", self.jmp_count() as u64);
        set_hex(obj, "call_count", self.call_count() as u64);
        let records = self
            .references
            .iter()
            .map(|record| {
                let mut item = JsonObject::new();
                set_hex(&mut item, "addr", record.rva);
                set_int(
                    &mut item,
                    "type",
                    match record.kind {
                        XrefKind::Data => 0,
                        XrefKind::Jmp => 1,
                        XrefKind::Call => 2,
                    },
                );
                Value::Object(item)
            })
            .collect();
        obj.insert("references".to_string(), Value::Array(records));
    }

    fn load(obj: &JsonObject) -> Option<Self> {
        let records = obj.get("references")?.as_array()?;
        let mut references = Vec::with_capacity(records.len());
        for record in records {
            let record = record.as_object()?;
            references.push(XrefRecord {
                rva: get_hex(record, "addr")?,
                kind: match get_int(record, "type").unwrap_or(0) {
                    1 => XrefKind::Jmp,
                    2 => XrefKind::Call,
                    _ => XrefKind::Data,
                },
            });
        }
        Some(Self { references })
    }

    fn validate(&self, _rva: u64) -> bool {
        !self.references.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatchType {
    #[default]
    Uint,
    Int,
    Float,
}

impl WatchType {
    fn as_str(self) -> &'static str {
        match self {
            WatchType::Uint => "uint",
            WatchType::Int => "int",
            WatchType::Float => "float",
        }
    }

    fn parse(text: &str) -> Self {
        match text {
            "int" => WatchType::Int,
            "float" => WatchType::Float,
            _ => WatchType::Uint,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatchdogMode {
    #[default]
    Disabled,
    Changed,
    Unchanged,
    IsTrue,
    IsFalse,
}

impl WatchdogMode {
    fn as_str(self) -> &'static str {
        match self {
            WatchdogMode::Disabled => "Disabled",
            WatchdogMode::Changed => "Changed",
            WatchdogMode::Unchanged => "Unchanged",
            WatchdogMode::IsTrue => "IsTrue",
            WatchdogMode::IsFalse => "IsFalse",
        }
    }

    fn parse(text: &str) -> Self {
        match text {
            "Changed" => WatchdogMode::Changed,
            "Unchanged" => WatchdogMode::Unchanged,
            "IsTrue" => WatchdogMode::IsTrue,
            "IsFalse" => WatchdogMode::IsFalse,
            _ => WatchdogMode::Disabled,
        }
    }
}

/// Watch expression anchored at the address it was created on. Field names
/// keep the capitalized legacy spelling so old databases round-trip.
#[derive(Debug, Clone, PartialEq)]
pub struct Watch {
    pub name: String,
    pub expression: String,
    pub data_type: WatchType,
    pub watchdog_mode: WatchdogMode,
}

impl EntryPayload for Watch {
    const JSON_KEY: &'static str = "watches";
    const LEGACY_KEY: Option<&'static str> = Some("Watch");

    fn save(&self, obj: &mut JsonObject) {
        set_str(obj, "Name", &self.name);
        set_str(obj, "Expression", &self.expression);
        set_str(obj, "DataType", self.data_type.as_str());
        set_str(obj, "WatchdogMode", self.watchdog_mode.as_str());
    }

    fn load(obj: &JsonObject) -> Option<Self> {
        Some(Self {
            name: get_str(obj, "Name").unwrap_or_default().to_string(),
            expression: get_str(obj, "Expression")?.to_string(),
            data_type: WatchType::parse(get_str(obj, "DataType").unwrap_or_default()),
            watchdog_mode: WatchdogMode::parse(get_str(obj, "WatchdogMode").unwrap_or_default()),
        })
    }

    fn validate(&self, _rva: u64) -> bool {
        valid_text(&self.expression, MAX_COMMENT_SIZE)
    }
}

/// Per-address instruction encoding override blob, one entry per memory
/// region base. Persisted as hex since the payload is raw bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeMap {
    pub data: Vec<u8>,
}

impl EntryPayload for EncodeMap {
    const JSON_KEY: &'static str = "encodemaps";

    fn save(&self, obj: &mut JsonObject) {
        let hex: String = self.data.iter().map(|b| format!("{b:02x}")).collect();
        set_str(obj, "data", &hex);
    }

    fn load(obj: &JsonObject) -> Option<Self> {
        let hex = get_str(obj, "data")?;
        if hex.len() % 2 != 0 {
            return None;
        }
        let data = (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16))
            .collect::<Result<Vec<_>, _>>()
            .ok()?;
        Some(Self { data })
    }

    fn validate(&self, _rva: u64) -> bool {
        !self.data.is_empty()
    }
}

/// Persisted breakpoint. The stepping engine owns live breakpoints; only the
/// fields needed to re-arm one after a reload are stored. Single-shot
/// breakpoints are intentionally not persisted by callers.
#[derive(Debug, Clone, PartialEq)]
pub struct Breakpoint {
    pub enabled: bool,
    pub bp_type: u32,
    pub titan_type: u32,
    /// Original instruction bytes displaced by a software breakpoint.
    pub old_bytes: u16,
    pub name: String,
}

impl EntryPayload for Breakpoint {
    const JSON_KEY: &'static str = "breakpoints";

    fn save(&self, obj: &mut JsonObject) {
        set_bool(obj, "enabled", self.enabled);
        if self.bp_type == 0 {
            set_hex(obj, "oldbytes", self.old_bytes as u64);
        }
        set_int(obj, "type", self.bp_type as u64);
        set_hex(obj, "titantype", self.titan_type as u64);
        set_str(obj, "name", &self.name);
    }

    fn load(obj: &JsonObject) -> Option<Self> {
        Some(Self {
            enabled: get_bool(obj, "enabled").unwrap_or(true),
            bp_type: get_int(obj, "type").unwrap_or(0) as u32,
            titan_type: get_hex(obj, "titantype").unwrap_or(0) as u32,
            old_bytes: get_hex(obj, "oldbytes").unwrap_or(0) as u16,
            name: get_str(obj, "name").unwrap_or_default().to_string(),
        })
    }
}

fn range_end_rva(store_space: &crate::address::AddressSpace, start_va: u64, end_va: u64) -> Option<u64> {
    if end_va < start_va {
        return None;
    }
    let (start_module, _) = store_space.resolve(start_va);
    let (end_module, end_rva) = store_space.resolve(end_va);
    if !start_module.eq_ignore_ascii_case(&end_module) {
        return None;
    }
    Some(end_rva)
}

impl EntryStore<Function> {
    /// Bracket `[start_va, end_va]` as a function. Both ends must sit in the
    /// same module.
    pub fn add_range(&self, start_va: u64, end_va: u64, icount: u64, manual: bool) -> bool {
        match range_end_rva(self.space(), start_va, end_va) {
            Some(end) => self.add(start_va, Function { end, icount }, manual),
            None => false,
        }
    }
}

impl EntryStore<Argument> {
    pub fn add_range(&self, start_va: u64, end_va: u64, icount: u64, manual: bool) -> bool {
        match range_end_rva(self.space(), start_va, end_va) {
            Some(end) => self.add(start_va, Argument { end, icount }, manual),
            None => false,
        }
    }
}

impl EntryStore<LoopBracket> {
    pub fn add_range(&self, start_va: u64, end_va: u64, depth: u32, parent: u64, manual: bool) -> bool {
        match range_end_rva(self.space(), start_va, end_va) {
            Some(end) => self.add(start_va, LoopBracket { end, parent, depth }, manual),
            None => false,
        }
    }
}

impl EntryStore<Xref> {
    /// Record that `from_va` references `to_va`. Both must live in the same
    /// module; duplicate records at the same source collapse.
    pub fn add_reference(&self, to_va: u64, from_va: u64, kind: XrefKind) -> bool {
        let (to_module, _) = self.space().resolve(to_va);
        let (from_module, from_rva) = self.space().resolve(from_va);
        if !to_module.eq_ignore_ascii_case(&from_module) {
            return false;
        }
        let mut xref = self.get(to_va).map(|entry| entry.payload).unwrap_or_default();
        if let Some(existing) = xref.references.iter_mut().find(|r| r.rva == from_rva) {
            existing.kind = kind;
        } else {
            xref.references.push(XrefRecord { rva: from_rva, kind });
        }
        self.add(to_va, xref, false)
    }
}
