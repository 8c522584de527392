use std::collections::HashMap;

use regex::Regex;
use tracing::debug;

use super::{ContentKind, ItemParser, MatchType, ParserDefinition};
use crate::error::{Error, Result};

/// Routes URLs to parser definitions.
///
/// Precedence: exact match, then the longest `Contains` pattern, then the
/// longest `End` suffix, then the first matching regex, then a wildcard.
/// Ties inside a tier go to the definition registered first.
#[derive(Debug, Default)]
pub struct ParserRegistry {
    definitions: Vec<ParserDefinition>,
    exact: HashMap<String, usize>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a definition, compiling its regexes.
    ///
    /// Rejects invalid regexes and JSON item paths over raw payloads.
    pub fn register(&mut self, mut def: ParserDefinition) -> Result<()> {
        let invalid = |reason: String| Error::InvalidDefinition {
            label: def.label.clone(),
            reason,
        };

        if def.match_type == MatchType::Regex {
            let re = Regex::new(&def.pattern).map_err(|e| invalid(format!("URL pattern: {e}")))?;
            def.url_regex = Some(re);
        }

        match &def.item_parser {
            ItemParser::Regex(pattern) => {
                let re = Regex::new(pattern).map_err(|e| invalid(format!("item regex: {e}")))?;
                def.item_regex = Some(re);
            }
            ItemParser::JsonPath(_) if def.content_kind == ContentKind::Raw => {
                return Err(invalid("JSON item path on a raw payload".to_string()));
            }
            _ => {}
        }

        let index = self.definitions.len();
        if def.match_type == MatchType::Exact {
            self.exact.entry(def.pattern.clone()).or_insert(index);
        }
        debug!(label = %def.label, pattern = %def.pattern, match_type = ?def.match_type, "registered parser");
        self.definitions.push(def);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn definitions(&self) -> &[ParserDefinition] {
        &self.definitions
    }

    fn select(&self, url: &str) -> Option<usize> {
        if let Some(&index) = self.exact.get(url) {
            return Some(index);
        }

        self.longest(url, MatchType::Contains)
            .or_else(|| self.longest(url, MatchType::End))
            .or_else(|| self.first(url, MatchType::Regex))
            .or_else(|| self.first(url, MatchType::Wildcard))
    }

    fn candidates(&self, url: &str, tier: MatchType) -> impl Iterator<Item = (usize, &ParserDefinition)> + '_ {
        let url = url.to_string();
        self.definitions
            .iter()
            .enumerate()
            .filter(move |(_, def)| def.match_type == tier && def.matches(&url))
    }

    fn longest(&self, url: &str, tier: MatchType) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for (index, def) in self.candidates(url, tier) {
            let len = def.pattern.len();
            // strict comparison keeps the first registered on ties
            if best.map_or(true, |(_, best_len)| len > best_len) {
                best = Some((index, len));
            }
        }
        best.map(|(index, _)| index)
    }

    fn first(&self, url: &str, tier: MatchType) -> Option<usize> {
        self.candidates(url, tier).next().map(|(index, _)| index)
    }

    /// The single definition responsible for `url`.
    pub fn resolve(&self, url: &str) -> Result<&ParserDefinition> {
        let index = self.select(url).ok_or_else(|| Error::NoParserFound { url: url.to_string() })?;
        let def = &self.definitions[index];
        debug!(url, label = %def.label, match_type = ?def.match_type, "resolved parser");
        Ok(def)
    }

    /// The selected definition followed by every other definition sharing
    /// its pattern and match type, in registration order.
    pub fn resolve_chain(&self, url: &str) -> Result<Vec<&ParserDefinition>> {
        let index = self.select(url).ok_or_else(|| Error::NoParserFound { url: url.to_string() })?;
        let primary = &self.definitions[index];

        let mut chain = vec![primary];
        chain.extend(
            self.definitions
                .iter()
                .enumerate()
                .filter(|(i, def)| *i != index && def.same_key(primary))
                .map(|(_, def)| def),
        );
        debug!(url, label = %primary.label, chain = chain.len(), "resolved parser chain");
        Ok(chain)
    }
}
