// Message diff engine: reconcile a client-supplied message list against
// stored history, producing insert/update/delete/unchanged operations with
// suffix alignment for client-side-truncated histories.

use serde_json::Value;

/// Tool call snapshot used for comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments; compared canonically (key order and
    /// whitespace insensitive).
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiffToolOutput {
    pub tool_call_id: String,
    pub output: String,
    pub status: String,
}

/// One message on either side of the diff.
#[derive(Debug, Clone)]
pub struct DiffMessage {
    pub role: String,
    /// String content or a multimodal part array.
    pub content: Value,
    pub tool_calls: Vec<DiffToolCall>,
    pub tool_outputs: Vec<DiffToolOutput>,
}

impl DiffMessage {
    pub fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: Value::String(content.to_string()),
            tool_calls: Vec::new(),
            tool_outputs: Vec::new(),
        }
    }
}

/// Update of one aligned pair, with the tool-artifact sub-diff.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdatePlan {
    pub stored_index: usize,
    pub incoming_index: usize,
    /// True when role/content changed (not only tool artifacts).
    pub content_changed: bool,
    /// Indices into the incoming message's `tool_calls`.
    pub tool_calls_to_update: Vec<usize>,
    /// Indices into the incoming message's `tool_outputs`.
    pub tool_outputs_to_insert: Vec<usize>,
    pub tool_outputs_to_update: Vec<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct MessageDiff {
    pub valid: bool,
    pub fallback: bool,
    pub reason: Option<String>,
    /// Index into stored where the incoming list aligns.
    pub anchor_offset: usize,
    /// Retained prefix rows plus aligned rows that match exactly.
    pub unchanged: usize,
    /// Indices into incoming that must be inserted after the aligned region.
    pub inserts: Vec<usize>,
    pub updates: Vec<UpdatePlan>,
    /// Indices into stored that must be deleted.
    pub deletes: Vec<usize>,
}

impl MessageDiff {
    fn invalid(reason: &str) -> Self {
        Self {
            valid: false,
            fallback: true,
            reason: Some(reason.to_string()),
            ..Default::default()
        }
    }

    pub fn is_noop(&self) -> bool {
        self.valid && self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// Canonical form of a JSON value: object keys sorted, no whitespace.
fn canonicalize(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonicalize(&map[k])))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

/// Normalized content for comparison: strings are trimmed, arrays are
/// canonicalized to their JSON form.
fn normalized_content(content: &Value) -> String {
    match content {
        Value::String(text) => text.trim().to_string(),
        other => canonicalize(other),
    }
}

fn normalized_arguments(arguments: &str) -> String {
    match serde_json::from_str::<Value>(arguments) {
        Ok(value) => canonicalize(&value),
        Err(_) => arguments.trim().to_string(),
    }
}

/// The alignment-level equality: role plus normalized content.
fn aligns(a: &DiffMessage, b: &DiffMessage) -> bool {
    a.role == b.role && normalized_content(&a.content) == normalized_content(&b.content)
}

fn tool_calls_equal(a: &DiffToolCall, b: &DiffToolCall) -> bool {
    a.name == b.name && normalized_arguments(&a.arguments) == normalized_arguments(&b.arguments)
}

fn tool_outputs_equal(a: &DiffToolOutput, b: &DiffToolOutput) -> bool {
    a.tool_call_id == b.tool_call_id && a.output == b.output && a.status == b.status
}

/// Compute the mutations that reproduce `incoming` from `stored`.
pub fn compute_message_diff(stored: &[DiffMessage], incoming: &[DiffMessage]) -> MessageDiff {
    if incoming.is_empty() {
        // Nothing to reconcile; retain history untouched.
        return MessageDiff {
            valid: true,
            anchor_offset: stored.len(),
            unchanged: stored.len(),
            ..Default::default()
        };
    }

    if stored.is_empty() {
        return MessageDiff {
            valid: true,
            inserts: (0..incoming.len()).collect(),
            ..Default::default()
        };
    }

    let Some(anchor) = find_anchor(stored, incoming) else {
        let any_partial = (0..stored.len())
            .any(|k| aligns(&stored[k], &incoming[0]));
        return MessageDiff::invalid(if any_partial {
            "misaligned"
        } else {
            "insufficient overlap"
        });
    };

    classify(stored, incoming, anchor)
}

/// Smallest k such that every incoming message that overlaps stored[k..]
/// aligns with its counterpart. k=0 is the plain prefix match.
fn find_anchor(stored: &[DiffMessage], incoming: &[DiffMessage]) -> Option<usize> {
    'outer: for k in 0..=stored.len() {
        let overlap = incoming.len().min(stored.len() - k);
        for i in 0..overlap {
            if !aligns(&stored[k + i], &incoming[i]) {
                continue 'outer;
            }
        }
        // An anchor past the stored tail would make every incoming row an
        // append with no aligned pair; only accept it when nothing overlaps.
        if k == stored.len() {
            return None;
        }
        return Some(k);
    }
    None
}

fn classify(stored: &[DiffMessage], incoming: &[DiffMessage], anchor: usize) -> MessageDiff {
    let mut diff = MessageDiff {
        valid: true,
        anchor_offset: anchor,
        unchanged: anchor,
        ..Default::default()
    };

    let overlap = incoming.len().min(stored.len() - anchor);
    for i in 0..overlap {
        let stored_msg = &stored[anchor + i];
        let incoming_msg = &incoming[i];

        match sub_diff(stored_msg, incoming_msg) {
            SubDiff::Equal => diff.unchanged += 1,
            SubDiff::Update(mut plan) => {
                plan.stored_index = anchor + i;
                plan.incoming_index = i;
                diff.updates.push(plan);
            }
            SubDiff::Fallback(reason) => return MessageDiff::invalid(&reason),
        }
    }

    diff.deletes = (anchor + overlap..stored.len()).collect();
    diff.inserts = (overlap..incoming.len()).collect();
    diff
}

enum SubDiff {
    Equal,
    Update(UpdatePlan),
    Fallback(String),
}

/// Compare an aligned pair in full, including tool artifacts.
fn sub_diff(stored: &DiffMessage, incoming: &DiffMessage) -> SubDiff {
    if stored.tool_calls.len() != incoming.tool_calls.len() {
        return SubDiff::Fallback("Tool call count changed".to_string());
    }

    let mut plan = UpdatePlan::default();

    for (index, (stored_call, incoming_call)) in stored
        .tool_calls
        .iter()
        .zip(incoming.tool_calls.iter())
        .enumerate()
    {
        if !tool_calls_equal(stored_call, incoming_call) {
            plan.tool_calls_to_update.push(index);
        }
    }

    for (index, incoming_output) in incoming.tool_outputs.iter().enumerate() {
        match stored
            .tool_outputs
            .iter()
            .find(|stored_output| stored_output.tool_call_id == incoming_output.tool_call_id)
        {
            None => plan.tool_outputs_to_insert.push(index),
            Some(stored_output) => {
                if !tool_outputs_equal(stored_output, incoming_output) {
                    plan.tool_outputs_to_update.push(index);
                }
            }
        }
    }

    // Alignment guarantees role/content match at the normalized level; a
    // byte-level content difference still counts as an update.
    plan.content_changed = stored.content != incoming.content;

    if !plan.content_changed
        && plan.tool_calls_to_update.is_empty()
        && plan.tool_outputs_to_insert.is_empty()
        && plan.tool_outputs_to_update.is_empty()
    {
        SubDiff::Equal
    } else {
        SubDiff::Update(plan)
    }
}
