use codegraph_core::{
    CodeGraphError, ContentHash, IncrementalConfig, IndexStorage, Symbol, SymbolId, SymbolKey,
    SymbolRecord,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// Why a change was routed to a full re-index instead of an incremental write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FullReindexReason {
    /// Nothing stored for the path yet
    NoPreviousVersion,
    /// The new revision has no symbols to diff
    NoSymbols,
    /// Symbol count moved by more than the configured share
    SymbolCountShift,
    /// Too many added/removed/modified symbols relative to the new total
    ChangeRatio,
    /// A symbol span points outside its file text
    SpanOutOfRange,
    /// Two symbols in one revision share a key
    AmbiguousKeys,
}

impl fmt::Display for FullReindexReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FullReindexReason::NoPreviousVersion => "no previous version",
            FullReindexReason::NoSymbols => "no symbols",
            FullReindexReason::SymbolCountShift => "symbol count shift",
            FullReindexReason::ChangeRatio => "change ratio",
            FullReindexReason::SpanOutOfRange => "span out of range",
            FullReindexReason::AmbiguousKeys => "ambiguous symbol keys",
        };
        f.write_str(s)
    }
}

/// Symbol-level classification of one file revision against the stored one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffResult {
    pub added: Vec<Symbol>,
    pub removed: Vec<Symbol>,
    pub modified: Vec<Symbol>,
    pub unchanged: Vec<Symbol>,
    /// Stored ids of `removed`, in the same order
    pub affected_symbol_ids: Vec<SymbolId>,
    /// Stored ids of the old versions of `modified`, in the same order
    pub replaced_symbol_ids: Vec<SymbolId>,
    pub needs_full_reindex: bool,
    pub reason: Option<FullReindexReason>,
}

impl DiffResult {
    pub fn full(reason: FullReindexReason) -> Self {
        Self {
            needs_full_reindex: true,
            reason: Some(reason),
            ..Self::default()
        }
    }

    /// Once set, a full re-index stays set.
    fn force_full(&mut self, reason: FullReindexReason) {
        if !self.needs_full_reindex {
            self.needs_full_reindex = true;
            self.reason = Some(reason);
        }
    }

    pub fn change_count(&self) -> usize {
        self.added.len() + self.removed.len() + self.modified.len()
    }

    pub fn is_noop(&self) -> bool {
        !self.needs_full_reindex && self.change_count() == 0
    }
}

/// Decides between incremental and full re-indexing of a file.
#[derive(Debug, Clone, Default)]
pub struct ChangeAnalyzer {
    config: IncrementalConfig,
}

impl ChangeAnalyzer {
    pub fn new(config: IncrementalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &IncrementalConfig {
        &self.config
    }

    /// Diff `new_symbols` against whatever `storage` holds for `path`.
    pub async fn analyze_changes<S: IndexStorage + ?Sized>(
        &self,
        storage: &S,
        path: &str,
        new_content: &str,
        new_symbols: &[Symbol],
    ) -> Result<DiffResult, CodeGraphError> {
        let Some(file) = storage.find_file_by_path(path).await? else {
            return Ok(DiffResult::full(FullReindexReason::NoPreviousVersion));
        };
        let old_symbols = storage.find_symbols_by_file_id(file.id).await?;
        Ok(self.diff(
            Some((file.content.as_str(), old_symbols.as_slice())),
            new_content,
            new_symbols,
        ))
    }

    /// Pure diff of a new revision against an optional stored one.
    pub fn diff(
        &self,
        previous: Option<(&str, &[SymbolRecord])>,
        new_content: &str,
        new_symbols: &[Symbol],
    ) -> DiffResult {
        let Some((old_content, old_symbols)) = previous else {
            return DiffResult::full(FullReindexReason::NoPreviousVersion);
        };
        if new_symbols.is_empty() {
            return DiffResult::full(FullReindexReason::NoSymbols);
        }

        let new_count = new_symbols.len();
        let delta = new_count.abs_diff(old_symbols.len());
        if delta >= self.config.min_count_delta
            && delta as f64 > self.config.symbol_count_threshold * new_count as f64
        {
            debug!(
                "Symbol count moved {} -> {}; full re-index",
                old_symbols.len(),
                new_count
            );
            return DiffResult::full(FullReindexReason::SymbolCountShift);
        }

        let Some(old_by_key) = index_by_key(old_symbols.iter().map(|r| (r.symbol.key(), r))) else {
            return DiffResult::full(FullReindexReason::AmbiguousKeys);
        };
        let Some(new_by_key) = index_by_key(new_symbols.iter().map(|s| (s.key(), s))) else {
            return DiffResult::full(FullReindexReason::AmbiguousKeys);
        };

        let old_lines: Vec<&str> = old_content.lines().collect();
        let new_lines: Vec<&str> = new_content.lines().collect();
        let Some(new_spans) = new_symbols
            .iter()
            .map(|symbol| span_text(&new_lines, symbol))
            .collect::<Option<Vec<String>>>()
        else {
            debug!("A new symbol span falls outside the file");
            return DiffResult::full(FullReindexReason::SpanOutOfRange);
        };
        let mut diff = DiffResult::default();

        for (symbol, new_span) in new_symbols.iter().zip(&new_spans) {
            let Some(old) = old_by_key.get(&symbol.key()) else {
                diff.added.push(symbol.clone());
                continue;
            };
            let Some(old_span) = span_text(&old_lines, &old.symbol) else {
                debug!("Stored span of {} falls outside the file", symbol.key());
                return DiffResult::full(FullReindexReason::SpanOutOfRange);
            };

            if ContentHash::of(&old_span) == ContentHash::of(new_span) {
                diff.unchanged.push(symbol.clone());
            } else {
                diff.modified.push(symbol.clone());
                diff.replaced_symbol_ids.push(old.id);
            }
        }

        for record in old_symbols {
            if !new_by_key.contains_key(&record.symbol.key()) {
                diff.removed.push(record.symbol.clone());
                diff.affected_symbol_ids.push(record.id);
            }
        }

        let ratio = diff.change_count() as f64 / new_count as f64;
        if ratio > self.config.change_ratio_threshold {
            debug!(
                "Change ratio {:.2} exceeds {:.2}; full re-index",
                ratio, self.config.change_ratio_threshold
            );
            diff.force_full(FullReindexReason::ChangeRatio);
        }

        diff
    }
}

/// `None` when two items share a key.
fn index_by_key<'a, T>(
    items: impl Iterator<Item = (SymbolKey, &'a T)>,
) -> Option<HashMap<SymbolKey, &'a T>> {
    let mut map = HashMap::new();
    for (key, item) in items {
        if map.insert(key, item).is_some() {
            return None;
        }
    }
    Some(map)
}

/// Source text covered by a symbol. Lines are 1-based inclusive, columns are
/// character offsets with the end column exclusive and clamped to the line.
fn span_text(lines: &[&str], symbol: &Symbol) -> Option<String> {
    if symbol.start_line == 0 || symbol.end_line < symbol.start_line {
        return None;
    }
    let first = symbol.start_line as usize - 1;
    let last = symbol.end_line as usize - 1;
    if last >= lines.len() {
        return None;
    }

    let mut text = String::new();
    for (index, line) in lines.iter().enumerate().take(last + 1).skip(first) {
        let from = if index == first {
            symbol.start_column as usize
        } else {
            0
        };
        let to = if index == last {
            symbol.end_column as usize
        } else {
            usize::MAX
        };
        text.extend(line.chars().skip(from).take(to.saturating_sub(from)));
        if index != last {
            text.push('\n');
        }
    }
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use codegraph_core::SymbolKind;

    fn func(name: &str, line: u32) -> Symbol {
        Symbol::new(name, SymbolKind::Function, line, line)
    }

    fn records(symbols: &[Symbol]) -> Vec<SymbolRecord> {
        symbols
            .iter()
            .enumerate()
            .map(|(i, s)| SymbolRecord {
                id: 100 + i as u64,
                file_id: 1,
                symbol: s.clone(),
            })
            .collect()
    }

    #[test]
    fn test_span_text_respects_columns() {
        let lines = vec!["let a = 1;", "fn foo() {", "  body", "}"];
        let symbol = Symbol::new("foo", SymbolKind::Function, 2, 4).with_columns(3, 1);
        assert_eq!(span_text(&lines, &symbol).unwrap(), "foo() {\n  body\n}");

        let whole = Symbol::new("a", SymbolKind::Variable, 1, 1);
        assert_eq!(span_text(&lines, &whole).unwrap(), "let a = 1;");

        assert!(span_text(&lines, &Symbol::new("x", SymbolKind::Function, 4, 5)).is_none());
        assert!(span_text(&lines, &Symbol::new("x", SymbolKind::Function, 0, 1)).is_none());
    }

    #[test]
    fn test_no_previous_version_is_full() {
        let analyzer = ChangeAnalyzer::default();
        let diff = analyzer.diff(None, "fn a() {}", &[func("a", 1)]);
        assert!(diff.needs_full_reindex);
        assert_eq!(diff.reason, Some(FullReindexReason::NoPreviousVersion));
    }

    #[test]
    fn test_empty_new_revision_is_full() {
        let analyzer = ChangeAnalyzer::default();
        let old = records(&[func("a", 1)]);
        let diff = analyzer.diff(Some(("fn a() {}", old.as_slice())), "", &[]);
        assert_eq!(diff.reason, Some(FullReindexReason::NoSymbols));
    }

    #[test]
    fn test_modified_body_with_fixed_signature() {
        let analyzer = ChangeAnalyzer::default();
        let old_content = "fn a() { 1 }\nfn b() { 2 }\nfn c() { 3 }";
        let new_content = "fn a() { 1 }\nfn b() { 20 }\nfn c() { 3 }";
        let symbols = [func("a", 1), func("b", 2), func("c", 3)];
        let old = records(&symbols);

        let diff = analyzer.diff(Some((old_content, old.as_slice())), new_content, &symbols);
        assert!(!diff.needs_full_reindex);
        assert_eq!(diff.modified, vec![func("b", 2)]);
        assert_eq!(diff.replaced_symbol_ids, vec![101]);
        assert_eq!(diff.unchanged.len(), 2);
        assert!(diff.added.is_empty() && diff.removed.is_empty());
    }

    #[test]
    fn test_duplicate_keys_force_full() {
        let analyzer = ChangeAnalyzer::default();
        let old = records(&[func("a", 1), func("b", 2)]);
        let new_symbols = [func("a", 1), func("a", 1)];
        let diff = analyzer.diff(Some(("fn a\nfn b", old.as_slice())), "fn a\nfn b", &new_symbols);
        assert_eq!(diff.reason, Some(FullReindexReason::AmbiguousKeys));
    }

    #[test]
    fn test_out_of_range_span_forces_full() {
        let analyzer = ChangeAnalyzer::default();
        let old = records(&[func("a", 1), func("b", 5)]);
        let diff = analyzer.diff(
            Some(("fn a\n\n\n\nfn b", old.as_slice())),
            "fn a\nfn b",
            &[func("a", 1), func("b", 5)],
        );
        assert_eq!(diff.reason, Some(FullReindexReason::SpanOutOfRange));
    }

    #[test]
    fn test_added_symbol_outside_file_forces_full() {
        let analyzer = ChangeAnalyzer::default();
        let content = "fn a\nfn b\nfn c";
        let symbols = [func("a", 1), func("b", 2), func("c", 3)];
        let old = records(&symbols);
        let mut new_symbols = symbols.to_vec();
        new_symbols.push(Symbol::new("ghost", SymbolKind::Function, 99, 120));

        let diff = analyzer.diff(Some((content, old.as_slice())), content, &new_symbols);
        assert!(diff.needs_full_reindex);
        assert_eq!(diff.reason, Some(FullReindexReason::SpanOutOfRange));
        assert!(diff.added.is_empty());
    }

    #[test]
    fn test_full_reindex_is_not_cleared() {
        let mut diff = DiffResult::full(FullReindexReason::SymbolCountShift);
        diff.force_full(FullReindexReason::ChangeRatio);
        assert!(diff.needs_full_reindex);
        assert_eq!(diff.reason, Some(FullReindexReason::SymbolCountShift));
    }
}
