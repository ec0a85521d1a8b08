//! Full-text keyword filters.
//!
//! Keywords are matched case-insensitively as substrings; a candidate passes
//! if any keyword occurs in any of its searchable text fields.

use std::collections::BTreeSet;

use crate::builder::Draft;
use crate::error::{Error, Result};

/// Filter on free text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullTextFilter {
    /// Lower-cased keywords, computed once at build time.
    keywords: BTreeSet<String>,
}

impl FullTextFilter {
    pub fn builder() -> FullTextFilterBuilder {
        FullTextFilterBuilder {
            draft: Draft::new("FullTextFilter", BTreeSet::new()),
        }
    }

    /// Filter on the given keywords.
    pub fn keywords<I, S>(keywords: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = Self::builder();
        for k in keywords {
            builder.with_keyword(k.as_ref());
        }
        builder.build()
    }

    pub fn keyword_set(&self) -> &BTreeSet<String> {
        &self.keywords
    }

    /// Whether `text` contains any keyword.
    pub fn test(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        self.keywords.iter().any(|k| text.contains(k.as_str()))
    }

    /// Whether any of the text fields contains any keyword.
    pub fn test_any<'a>(&self, texts: impl IntoIterator<Item = &'a str>) -> bool {
        texts.into_iter().any(|t| self.test(t))
    }

    pub fn intersect(&self, other: &FullTextFilter) -> Result<FullTextFilter> {
        intersect_text(self, other)
    }
}

/// Keyword-set intersection. An empty result fails.
pub fn intersect_text(a: &FullTextFilter, b: &FullTextFilter) -> Result<FullTextFilter> {
    let keywords: BTreeSet<String> = a.keywords.intersection(&b.keywords).cloned().collect();
    if keywords.is_empty() {
        return Err(Error::empty("full-text keyword sets are disjoint"));
    }
    Ok(FullTextFilter { keywords })
}

/// Builder for [`FullTextFilter`].
#[derive(Debug)]
pub struct FullTextFilterBuilder {
    draft: Draft<BTreeSet<String>>,
}

impl FullTextFilterBuilder {
    pub fn with_keyword(&mut self, keyword: &str) -> &mut Self {
        let keyword = keyword.trim().to_lowercase();
        if !keyword.is_empty() {
            self.draft.edit(|k| {
                k.insert(keyword);
            });
        }
        self
    }

    pub fn build(&mut self) -> Result<FullTextFilter> {
        let keywords = self.draft.take()?;
        if keywords.is_empty() {
            return Err(Error::validation("full-text filter needs at least one keyword"));
        }
        Ok(FullTextFilter { keywords })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_match() {
        let f = FullTextFilter::keywords(["Weather", "buoy"]).unwrap();
        assert!(f.test("Davis weather station"));
        assert!(f.test("Offshore BUOY 42"));
        assert!(!f.test("traffic camera"));
        assert!(f.test_any(["camera", "weather mast"]));
    }

    #[test]
    fn test_intersection() {
        let a = FullTextFilter::keywords(["temp", "wind"]).unwrap();
        let b = FullTextFilter::keywords(["WIND", "rain"]).unwrap();
        let c = intersect_text(&a, &b).unwrap();
        assert_eq!(c.keyword_set().len(), 1);
        assert!(c.keyword_set().contains("wind"));

        let d = FullTextFilter::keywords(["snow"]).unwrap();
        assert!(matches!(a.intersect(&d), Err(Error::EmptyIntersection(_))));
    }

    #[test]
    fn test_empty_rejected() {
        assert!(FullTextFilter::keywords(["  "]).is_err());
    }
}
