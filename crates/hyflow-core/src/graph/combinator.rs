//! Input combinators: deciding when a step invocation becomes runnable.
//!
//! Each step owns one [`InputCombinator`] holding the tokens delivered to its
//! input slots. Delivering a token or closing a slot yields the invocations
//! ([`Fire`]s) that became runnable as a result. Every tag (dot product) or
//! token combination (cartesian product) fires at most once.
//!
//! Dot product matching: an invocation with tag `t` fires when every required
//! slot holds a token whose tag is a prefix of `t`, and no slot holds a token
//! strictly below `t`. A shallower token is therefore broadcast to every
//! deeper invocation, which is how a single reference value pairs with each
//! item of a scatter.

use std::collections::{BTreeMap, HashSet};

use hyflow_types::token::{Payload, Tag, TerminationReason, Token};
use hyflow_types::workflow::{Combinator, SlotMode, StepDefinition};
use uuid::Uuid;

/// One runnable invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Fire {
    pub tag: Tag,
    /// Input tokens by slot name. Absent optional slots have no entry.
    pub inputs: BTreeMap<String, Token>,
}

/// A required slot closed without delivering anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blocked {
    pub slot: String,
    pub reason: TerminationReason,
    pub propagate_skip: bool,
}

impl Blocked {
    fn severity(&self) -> u8 {
        match (self.reason, self.propagate_skip) {
            (TerminationReason::Cancelled, _) => 3,
            (TerminationReason::Completed, _) => 0,
            (_, false) => 2,
            (_, true) => 1,
        }
    }
}

#[derive(Debug)]
struct SlotState {
    name: String,
    required: bool,
    propagate_skip: bool,
    mode: SlotMode,
    /// Tokens available for matching, in arrival order.
    tokens: Vec<Token>,
    /// Gather mode: tokens held back until the port closes.
    gathered: Vec<Token>,
    closed: Option<TerminationReason>,
}

/// Per-step input matching state.
#[derive(Debug)]
pub struct InputCombinator {
    step: String,
    kind: Combinator,
    slots: Vec<SlotState>,
    fired_tags: HashSet<Tag>,
    fired_sets: HashSet<Vec<Option<Uuid>>>,
}

impl InputCombinator {
    pub fn new(step: &StepDefinition) -> Self {
        Self {
            step: step.id.clone(),
            kind: step.combinator,
            slots: step
                .inputs
                .iter()
                .map(|s| SlotState {
                    name: s.name.clone(),
                    required: !s.optional,
                    propagate_skip: s.propagate_skip,
                    mode: s.mode,
                    tokens: Vec::new(),
                    gathered: Vec::new(),
                    closed: None,
                })
                .collect(),
            fired_tags: HashSet::new(),
            fired_sets: HashSet::new(),
        }
    }

    /// True once every slot has closed; no further invocation can fire.
    pub fn exhausted(&self) -> bool {
        self.slots.iter().all(|s| s.closed.is_some())
    }

    /// Steps without inputs fire exactly one root invocation.
    pub fn source_fire(&mut self) -> Option<Fire> {
        if !self.slots.is_empty() || !self.fired_tags.insert(Tag::root()) {
            return None;
        }
        Some(Fire {
            tag: Tag::root(),
            inputs: BTreeMap::new(),
        })
    }

    /// Record an invocation fired before a restart so it never fires again.
    pub fn mark_fired(&mut self, tag: &Tag, inputs: &BTreeMap<String, Token>) {
        self.fired_tags.insert(tag.clone());
        let key = self
            .slots
            .iter()
            .map(|s| inputs.get(&s.name).map(|t| t.id))
            .collect();
        self.fired_sets.insert(key);
    }

    /// Deliver a token to a slot and return the invocations it made runnable.
    pub fn offer(&mut self, slot: usize, token: &Token) -> Vec<Fire> {
        let Some(state) = self.slots.get_mut(slot) else {
            return Vec::new();
        };
        if state.closed.is_some() {
            return Vec::new();
        }

        let added: Vec<Token> = match state.mode {
            SlotMode::Stream => vec![token.clone()],
            SlotMode::Scatter => scatter(token),
            SlotMode::Gather => {
                state.gathered.push(token.clone());
                return Vec::new();
            }
        };
        state.tokens.extend(added.iter().cloned());

        let mut fires = Vec::new();
        for item in &added {
            match self.kind {
                Combinator::DotProduct => {
                    for tag in self.candidates_under(&item.tag) {
                        fires.extend(self.try_fire_dot(&tag));
                    }
                }
                Combinator::CartesianProduct => {
                    fires.extend(self.cartesian_fires(Some((slot, item))));
                }
            }
        }
        fires
    }

    /// Close a slot and return any invocations that became runnable because
    /// optional slots are now satisfied by absence (or a gather completed).
    pub fn close(&mut self, slot: usize, reason: TerminationReason) -> Vec<Fire> {
        let step = self.step.clone();
        let Some(state) = self.slots.get_mut(slot) else {
            return Vec::new();
        };
        if state.closed.is_some() {
            return Vec::new();
        }
        state.closed = Some(reason);

        if state.mode == SlotMode::Gather && reason == TerminationReason::Completed {
            let gathered = std::mem::take(&mut state.gathered);
            state.tokens.push(gather(&step, &state.name, gathered));
        }

        match self.kind {
            Combinator::DotProduct => {
                let mut tags: Vec<Tag> = self
                    .slots
                    .iter()
                    .flat_map(|s| s.tokens.iter().map(|t| t.tag.clone()))
                    .collect();
                tags.sort();
                tags.dedup();
                tags.iter().filter_map(|t| self.try_fire_dot(t)).collect()
            }
            Combinator::CartesianProduct => self.cartesian_fires(None),
        }
    }

    /// The most severe reason a required slot closed empty, if any.
    pub fn blocked(&self) -> Option<Blocked> {
        self.slots
            .iter()
            .filter(|s| s.required && s.tokens.is_empty())
            .filter_map(|s| {
                s.closed.map(|reason| Blocked {
                    slot: s.name.clone(),
                    reason,
                    propagate_skip: s.propagate_skip,
                })
            })
            .max_by_key(Blocked::severity)
    }

    // -----------------------------------------------------------------------
    // Dot product
    // -----------------------------------------------------------------------

    /// `tag` plus every held tag below it.
    fn candidates_under(&self, tag: &Tag) -> Vec<Tag> {
        let mut out: Vec<Tag> = self
            .slots
            .iter()
            .flat_map(|s| s.tokens.iter())
            .filter(|t| tag.is_prefix_of(&t.tag))
            .map(|t| t.tag.clone())
            .collect();
        out.push(tag.clone());
        out.sort();
        out.dedup();
        out
    }

    fn try_fire_dot(&mut self, tag: &Tag) -> Option<Fire> {
        if self.fired_tags.contains(tag) {
            return None;
        }
        let has_deeper = self.slots.iter().any(|s| {
            s.tokens
                .iter()
                .any(|t| t.tag.depth() > tag.depth() && tag.is_prefix_of(&t.tag))
        });
        if has_deeper {
            return None;
        }

        let mut inputs = BTreeMap::new();
        for slot in &self.slots {
            let matched = slot
                .tokens
                .iter()
                .filter(|t| t.tag.is_prefix_of(tag))
                .fold(None::<&Token>, |best, t| match best {
                    Some(b) if b.tag.depth() >= t.tag.depth() => Some(b),
                    _ => Some(t),
                });
            match matched {
                Some(token) => {
                    inputs.insert(slot.name.clone(), token.clone());
                }
                None if slot.required || slot.closed.is_none() => return None,
                None => {}
            }
        }

        self.fired_tags.insert(tag.clone());
        self.fired_sets.insert(
            self.slots
                .iter()
                .map(|s| inputs.get(&s.name).map(|t: &Token| t.id))
                .collect(),
        );
        Some(Fire {
            tag: tag.clone(),
            inputs,
        })
    }

    // -----------------------------------------------------------------------
    // Cartesian product
    // -----------------------------------------------------------------------

    fn cartesian_fires(&mut self, anchor: Option<(usize, &Token)>) -> Vec<Fire> {
        let mut choices: Vec<Vec<Option<&Token>>> = Vec::with_capacity(self.slots.len());
        for (idx, slot) in self.slots.iter().enumerate() {
            let options: Vec<Option<&Token>> = match anchor {
                Some((anchor_idx, token)) if anchor_idx == idx => vec![Some(token)],
                _ if !slot.tokens.is_empty() => slot.tokens.iter().map(Some).collect(),
                _ if !slot.required && slot.closed.is_some() => vec![None],
                _ => return Vec::new(),
            };
            choices.push(options);
        }

        let mut combos: Vec<Vec<Option<&Token>>> = vec![Vec::new()];
        for options in &choices {
            combos = combos
                .into_iter()
                .flat_map(|prefix| {
                    options.iter().map(move |o| {
                        let mut next = prefix.clone();
                        next.push(*o);
                        next
                    })
                })
                .collect();
        }

        let mut fires = Vec::new();
        for combo in combos {
            let key: Vec<Option<Uuid>> = combo.iter().map(|t| t.map(|t| t.id)).collect();
            if self.fired_sets.contains(&key) {
                continue;
            }
            let mut tag = Tag::root();
            let mut inputs = BTreeMap::new();
            for (slot, token) in self.slots.iter().zip(&combo) {
                if let Some(token) = token {
                    tag = tag.concat(&token.tag);
                    inputs.insert(slot.name.clone(), (*token).clone());
                }
            }
            self.fired_sets.insert(key);
            self.fired_tags.insert(tag.clone());
            fires.push(Fire { tag, inputs });
        }
        fires
    }
}

/// Expand a token into one item token per scattered element.
///
/// Item ids are derived from the parent id so that replaying the same port
/// contents after a restart yields the same items.
fn scatter(token: &Token) -> Vec<Token> {
    token
        .payload
        .scatter_items()
        .into_iter()
        .enumerate()
        .map(|(i, payload)| Token {
            id: Uuid::new_v5(&token.id, &(i as u64).to_be_bytes()),
            port: token.port.clone(),
            tag: token.tag.child(i as u32),
            seq: token.seq,
            payload,
            provenance: token.provenance.clone(),
        })
        .collect()
}

/// Collapse gathered tokens into one list token, ordered by tag.
fn gather(step: &str, slot: &str, mut tokens: Vec<Token>) -> Token {
    tokens.sort_by(|a, b| a.tag.cmp(&b.tag).then(a.seq.cmp(&b.seq)));

    let parents: Vec<Tag> = tokens
        .iter()
        .map(|t| {
            let indices = t.tag.indices();
            Tag::from_indices(indices[..indices.len().saturating_sub(1)].to_vec())
        })
        .collect();
    let tag = Tag::common_prefix(parents.iter());

    let mut name = format!("gather:{step}:{slot}:").into_bytes();
    for t in &tokens {
        name.extend_from_slice(t.id.as_bytes());
    }
    let port = tokens.first().map(|t| t.port.clone()).unwrap_or_default();

    let mut provenance = Vec::new();
    for entry in tokens.iter().flat_map(|t| t.provenance.iter()) {
        if !provenance.contains(entry) {
            provenance.push(entry.clone());
        }
    }

    Token {
        id: Uuid::new_v5(&Uuid::NAMESPACE_OID, &name),
        port,
        tag,
        seq: tokens.last().map(|t| t.seq).unwrap_or(0),
        payload: Payload::List(tokens.into_iter().map(|t| t.payload).collect()),
        provenance,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyflow_types::workflow::InputSlot;
    use serde_json::json;

    fn slot(name: &str, mode: SlotMode, optional: bool) -> InputSlot {
        InputSlot {
            name: name.into(),
            port: format!("p_{name}"),
            optional,
            propagate_skip: true,
            mode,
        }
    }

    fn step(slots: Vec<InputSlot>, combinator: Combinator) -> StepDefinition {
        let mut def: StepDefinition = serde_yaml_ng::from_str("id: s").unwrap();
        def.inputs = slots;
        def.combinator = combinator;
        def
    }

    fn tok(tag: Tag, value: serde_json::Value) -> Token {
        Token::new("p", tag, Payload::Value(value))
    }

    #[test]
    fn source_step_fires_root_once() {
        let mut c = InputCombinator::new(&step(vec![], Combinator::DotProduct));
        assert!(c.exhausted());
        assert_eq!(c.source_fire().unwrap().tag, Tag::root());
        assert!(c.source_fire().is_none());
    }

    #[test]
    fn dot_product_waits_for_all_required_slots() {
        let mut c = InputCombinator::new(&step(
            vec![slot("a", SlotMode::Stream, false), slot("b", SlotMode::Stream, false)],
            Combinator::DotProduct,
        ));
        assert!(c.offer(0, &tok(Tag::root(), json!(1))).is_empty());
        let fires = c.offer(1, &tok(Tag::root(), json!(2)));
        assert_eq!(fires.len(), 1);
        assert_eq!(fires[0].inputs.len(), 2);
        assert_eq!(fires[0].inputs["a"].payload, Payload::Value(json!(1)));
    }

    #[test]
    fn scatter_expands_and_broadcasts_shallow_tokens() {
        let mut c = InputCombinator::new(&step(
            vec![slot("items", SlotMode::Scatter, false), slot("ref", SlotMode::Stream, false)],
            Combinator::DotProduct,
        ));
        let array = tok(Tag::root(), json!(["x", "y", "z"]));
        assert!(c.offer(0, &array).is_empty(), "reference value not yet delivered");

        let fires = c.offer(1, &tok(Tag::root(), json!("genome")));
        let tags: Vec<String> = fires.iter().map(|f| f.tag.to_string()).collect();
        assert_eq!(tags, vec!["0.0", "0.1", "0.2"]);
        for (i, fire) in fires.iter().enumerate() {
            assert_eq!(fire.inputs["ref"].payload, Payload::Value(json!("genome")));
            assert_eq!(fire.inputs["items"].tag, Tag::root().child(i as u32));
            assert_eq!(fire.inputs["items"].id, Uuid::new_v5(&array.id, &(i as u64).to_be_bytes()));
        }
        assert!(c.close(0, TerminationReason::Completed).is_empty());
    }

    #[test]
    fn each_tag_fires_exactly_once() {
        let mut c = InputCombinator::new(&step(vec![slot("a", SlotMode::Stream, false)], Combinator::DotProduct));
        let t = tok(Tag::root().child(0), json!(1));
        assert_eq!(c.offer(0, &t).len(), 1);
        assert!(c.offer(0, &tok(Tag::root().child(0), json!(2))).is_empty());
        assert!(c.close(0, TerminationReason::Completed).is_empty());
    }

    #[test]
    fn mark_fired_suppresses_replayed_fires() {
        let mut c = InputCombinator::new(&step(vec![slot("a", SlotMode::Stream, false)], Combinator::DotProduct));
        let t = tok(Tag::root(), json!(1));
        let mut inputs = BTreeMap::new();
        inputs.insert("a".to_string(), t.clone());
        c.mark_fired(&Tag::root(), &inputs);
        assert!(c.offer(0, &t).is_empty());
    }

    #[test]
    fn optional_slot_satisfied_by_absence_after_close() {
        let mut c = InputCombinator::new(&step(
            vec![slot("a", SlotMode::Stream, false), slot("opt", SlotMode::Stream, true)],
            Combinator::DotProduct,
        ));
        assert!(c.offer(0, &tok(Tag::root(), json!(1))).is_empty());
        let fires = c.close(1, TerminationReason::Skipped);
        assert_eq!(fires.len(), 1);
        assert!(!fires[0].inputs.contains_key("opt"));
        assert!(c.blocked().is_none());
    }

    #[test]
    fn gather_collects_in_tag_order_on_completion() {
        let mut c = InputCombinator::new(&step(vec![slot("all", SlotMode::Gather, false)], Combinator::DotProduct));
        for i in [2u32, 0, 1] {
            let mut t = tok(Tag::root().child(i), json!(i));
            t.seq = u64::from(i);
            assert!(c.offer(0, &t).is_empty());
        }
        let fires = c.close(0, TerminationReason::Completed);
        assert_eq!(fires.len(), 1);
        assert_eq!(fires[0].tag, Tag::root());
        assert_eq!(fires[0].inputs["all"].payload.to_json(), json!([0, 1, 2]));
    }

    #[test]
    fn empty_gather_yields_empty_list() {
        let mut c = InputCombinator::new(&step(vec![slot("all", SlotMode::Gather, false)], Combinator::DotProduct));
        let fires = c.close(0, TerminationReason::Completed);
        assert_eq!(fires.len(), 1);
        assert_eq!(fires[0].inputs["all"].payload, Payload::List(vec![]));
    }

    #[test]
    fn failed_gather_blocks_the_step() {
        let mut c = InputCombinator::new(&step(vec![slot("all", SlotMode::Gather, false)], Combinator::DotProduct));
        c.offer(0, &tok(Tag::root().child(0), json!(0)));
        assert!(c.close(0, TerminationReason::Failed).is_empty());
        let blocked = c.blocked().unwrap();
        assert_eq!(blocked.reason, TerminationReason::Failed);
        assert!(blocked.propagate_skip);
    }

    #[test]
    fn blocked_prefers_most_severe_reason() {
        let mut def = step(
            vec![slot("a", SlotMode::Stream, false), slot("b", SlotMode::Stream, false)],
            Combinator::DotProduct,
        );
        def.inputs[1].propagate_skip = false;
        let mut c = InputCombinator::new(&def);
        c.close(0, TerminationReason::Skipped);
        assert_eq!(c.blocked().unwrap().slot, "a");
        c.close(1, TerminationReason::Failed);
        let blocked = c.blocked().unwrap();
        assert_eq!(blocked.slot, "b");
        assert!(!blocked.propagate_skip);
        assert!(c.exhausted());
    }

    #[test]
    fn empty_completed_close_is_not_a_skip() {
        let mut c = InputCombinator::new(&step(vec![slot("a", SlotMode::Scatter, false)], Combinator::DotProduct));
        assert!(c.offer(0, &tok(Tag::root(), json!([]))).is_empty());
        assert!(c.close(0, TerminationReason::Completed).is_empty());
        let blocked = c.blocked().unwrap();
        assert_eq!(blocked.reason, TerminationReason::Completed);
    }

    #[test]
    fn cartesian_fires_every_combination_once() {
        let mut c = InputCombinator::new(&step(
            vec![slot("x", SlotMode::Stream, false), slot("y", SlotMode::Stream, false)],
            Combinator::CartesianProduct,
        ));
        assert!(c.offer(0, &tok(Tag::root().child(0), json!("x0"))).is_empty());
        assert_eq!(c.offer(0, &tok(Tag::root().child(1), json!("x1"))).len(), 0);
        let fires = c.offer(1, &tok(Tag::root().child(0), json!("y0")));
        assert_eq!(fires.len(), 2);
        let fires2 = c.offer(1, &tok(Tag::root().child(1), json!("y1")));
        assert_eq!(fires2.len(), 2);

        let mut tags: Vec<String> = fires.iter().chain(&fires2).map(|f| f.tag.to_string()).collect();
        tags.sort();
        assert_eq!(tags, vec!["0.0.0", "0.0.1", "0.1.0", "0.1.1"]);

        assert!(c.close(0, TerminationReason::Completed).is_empty());
        assert!(c.close(1, TerminationReason::Completed).is_empty());
    }
}
