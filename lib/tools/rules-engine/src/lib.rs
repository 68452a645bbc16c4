//  Copyright (C) 2020-2022  The Authentic Execution developers.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Named-predicate validation rules for deployment descriptors.
//!
//! A rule set is an ordered list of named boolean verdicts computed over the
//! raw descriptor map of one record. Every broken rule is logged; the whole
//! set aggregates into a single error so the user sees all problems at once.

#![deny(
    missing_docs,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unstable_features,
    unused_import_braces
)]

#[macro_use]
extern crate log;

pub mod predicates;

use failure::Fail;

/// One named rule together with its verdict for a given record.
#[derive(Debug, Clone, Copy)]
pub struct Rule {
    /// Human-readable rule name, also used in error reports
    pub name: &'static str,
    /// Whether the record satisfies the rule
    pub ok: bool,
}

/// Build a rule from its name and verdict.
pub fn rule(name: &'static str, ok: bool) -> Rule {
    Rule { name, ok }
}

/// All broken rules of one record, aggregated.
#[derive(Debug, Clone, Fail)]
#[fail(display = "bad deployment descriptor: {} broken rule(s) for {}", count, kind)]
pub struct BrokenRules {
    /// Record kind the rules were evaluated for (node, module, ...)
    pub kind: String,
    /// Number of broken rules
    pub count: usize,
    /// Names of the broken rules
    pub broken: Vec<String>,
}

/// Evaluate a rule set, logging each broken rule. Returns an error
/// aggregating every broken rule name, or `Ok` if all rules hold.
pub fn enforce(kind: &str, rules: &[Rule]) -> Result<(), BrokenRules> {
    let broken: Vec<String> = rules
        .iter()
        .filter(|r| !r.ok)
        .map(|r| {
            error!("{} - broken rule: {}", kind, r.name);
            r.name.to_owned()
        })
        .collect();

    if broken.is_empty() {
        Ok(())
    } else {
        Err(BrokenRules {
            kind: kind.to_owned(),
            count: broken.len(),
            broken,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn all_rules_hold() {
        let rules = vec![rule("a", true), rule("b", true)];
        assert!(enforce("node", &rules).is_ok());
    }

    #[test]
    fn broken_rules_aggregate() {
        let rules = vec![rule("a", true), rule("b", false), rule("c", false)];
        let err = enforce("module", &rules).expect_err("two rules are broken");
        assert_eq!(err.kind, "module");
        assert_eq!(err.count, 2);
        assert_eq!(err.broken, vec!["b".to_owned(), "c".to_owned()]);
    }
}
