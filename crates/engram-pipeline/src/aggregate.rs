//! Derived artifacts over the active fact set: digest, daily log, weekly
//! snapshot, rolling topic files. Everything here is regenerable; nothing is
//! ever read back by the pipeline.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDate, Utc};
use serde_json::json;

use engram_core::config::EngramConfig;
use engram_core::key;
use engram_store::{Fact, FactStore};

use crate::error::Result;

/// Values longer than this (or structured) render as fenced blocks.
const INLINE_VALUE_MAX: usize = 100;
/// Rows shown in a key's history timeline table.
const TIMELINE_ROWS: usize = 5;

pub struct Aggregator<'a> {
    store: &'a FactStore,
    config: &'a EngramConfig,
}

impl<'a> Aggregator<'a> {
    pub fn new(store: &'a FactStore, config: &'a EngramConfig) -> Self {
        Self { store, config }
    }

    /// The digest: counts per category plus a few example facts each.
    pub fn digest(&self) -> Result<serde_json::Value> {
        let facts = self.store.active_all()?;
        let groups = group_by_category(&facts);
        let d = &self.config.digest;

        // Categories ranked by count; low-count ones fold out unless pinned
        // or explicitly shown.
        let mut ranked: Vec<(&String, &Vec<&Fact>)> = groups.iter().collect();
        ranked.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then(a.0.cmp(b.0)));

        let mut categories = serde_json::Map::new();
        let mut shown = 0usize;
        for (cat, members) in ranked {
            let forced = d.shown_categories.contains(cat)
                || members
                    .iter()
                    .any(|f| d.pinned_keys.contains(&f.key));
            if !forced && members.len() < d.min_count_for_l0 {
                continue;
            }
            if !forced && shown >= d.max_categories_in_l0 {
                continue;
            }
            shown += 1;

            let mut samples = serde_json::Map::new();
            for f in members
                .iter()
                .filter(|f| d.pinned_keys.contains(&f.key))
                .chain(members.iter().filter(|f| !d.pinned_keys.contains(&f.key)))
                .take(d.samples_per_category)
            {
                samples.insert(f.key.clone(), json!(truncate(&f.value, INLINE_VALUE_MAX)));
            }
            categories.insert(
                cat.to_string(),
                json!({ "count": members.len(), "facts": samples }),
            );
        }

        Ok(json!({
            "generated_at": Utc::now().to_rfc3339(),
            "total_facts": facts.len(),
            "summary": self.summary_from(&facts, &groups),
            "categories": categories,
        }))
    }

    pub fn write_digest(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let digest = self.digest()?;
        std::fs::write(path, serde_json::to_string_pretty(&digest)?)?;
        Ok(())
    }

    /// Compact one-line overview for `memory summary`.
    pub fn summary_line(&self) -> Result<String> {
        let facts = self.store.active_all()?;
        let groups = group_by_category(&facts);
        Ok(self.summary_from(&facts, &groups))
    }

    fn summary_from(&self, facts: &[Fact], groups: &BTreeMap<String, Vec<&Fact>>) -> String {
        let mut ranked: Vec<(&String, usize)> =
            groups.iter().map(|(c, m)| (c, m.len())).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        let top: Vec<String> = ranked
            .iter()
            .take(3)
            .map(|(c, n)| format!("{c}({n})"))
            .collect();
        format!(
            "{}: {} facts · top: {}",
            Utc::now().format("%Y-%m-%d"),
            facts.len(),
            if top.is_empty() {
                "none".to_string()
            } else {
                top.join(", ")
            }
        )
    }

    /// Markdown log of facts whose interval started on `date`.
    /// `None` when the day produced nothing.
    pub fn daily_markdown(&self, date: NaiveDate) -> Result<Option<String>> {
        let facts: Vec<Fact> = self
            .store
            .active_all()?
            .into_iter()
            .filter(|f| f.start_time.date_naive() == date)
            .collect();
        if facts.is_empty() {
            return Ok(None);
        }

        let mut out = format!("# Memory log — {date}\n");
        for (cat, members) in group_by_category(&facts) {
            out.push_str(&format!("\n## {cat} ({})\n", members.len()));
            for (sub, subfacts) in group_by_segment(&members, 1) {
                out.push_str(&format!("\n### {sub}\n\n"));
                for f in subfacts {
                    out.push_str(&render_value_line(&f.key, &f.value));
                }
            }
        }
        Ok(Some(out))
    }

    pub fn write_daily(&self, dir: &Path, date: NaiveDate) -> Result<()> {
        if let Some(md) = self.daily_markdown(date)? {
            std::fs::create_dir_all(dir)?;
            std::fs::write(dir.join(format!("{date}.md")), md)?;
        }
        Ok(())
    }

    /// Weekly snapshot: one file per category for the ISO week, plus an
    /// index. Returns the written paths.
    pub fn write_weekly(&self, dir: &Path, year: i32, week: u32) -> Result<Vec<PathBuf>> {
        let facts: Vec<Fact> = self
            .store
            .active_all()?
            .into_iter()
            .filter(|f| {
                let iso = f.start_time.iso_week();
                iso.year() == year && iso.week() == week
            })
            .collect();

        let week_dir = dir.join(format!("{year}-W{week:02}"));
        std::fs::create_dir_all(&week_dir)?;
        let mut written = Vec::new();

        let groups = group_by_category(&facts);
        for (cat, members) in &groups {
            let mut out = format!("# {cat} — week {year}-W{week:02}\n\n");
            for f in members {
                out.push_str(&render_value_line(&f.key, &f.value));
            }
            let path = week_dir.join(format!("{cat}.md"));
            std::fs::write(&path, out)?;
            written.push(path);
        }

        let index_path = week_dir.join("index.md");
        std::fs::write(&index_path, category_index(&groups, &format!("week {year}-W{week:02}")))?;
        written.push(index_path);
        Ok(written)
    }

    /// Rolling topic files: the whole active set, one file per category,
    /// with a history timeline for keys that changed over time.
    pub fn write_topics(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let facts = self.store.active_all()?;
        std::fs::create_dir_all(dir)?;
        let mut written = Vec::new();

        let groups = group_by_category(&facts);
        for (cat, members) in &groups {
            let mut out = format!("# {cat}\n");
            for (sub, subfacts) in group_by_segment(members, 1) {
                out.push_str(&format!("\n## {sub}\n\n"));
                for f in subfacts {
                    out.push_str(&render_value_line(&f.key, &f.value));
                    let history = self.store.history(&f.key)?;
                    if history.len() > 1 {
                        out.push_str(&timeline_table(&history));
                    }
                }
            }
            let path = dir.join(format!("{cat}.md"));
            std::fs::write(&path, out)?;
            written.push(path);
        }

        let index_path = dir.join("index.md");
        std::fs::write(&index_path, category_index(&groups, "all topics"))?;
        written.push(index_path);
        Ok(written)
    }
}

fn group_by_category<'f>(facts: &'f [Fact]) -> BTreeMap<String, Vec<&'f Fact>> {
    let mut groups: BTreeMap<String, Vec<&Fact>> = BTreeMap::new();
    for f in facts {
        groups
            .entry(key::category_of(&f.key).to_string())
            .or_default()
            .push(f);
    }
    groups
}

fn group_by_segment<'f>(facts: &[&'f Fact], n: usize) -> BTreeMap<String, Vec<&'f Fact>> {
    let mut groups: BTreeMap<String, Vec<&Fact>> = BTreeMap::new();
    for f in facts {
        let seg = key::segment(&f.key, n).unwrap_or("misc").to_string();
        groups.entry(seg).or_default().push(f);
    }
    groups
}

/// Short values inline, long or structured values as fenced blocks.
fn render_value_line(key: &str, value: &str) -> String {
    let structured = value.trim_start().starts_with('{') || value.trim_start().starts_with('[');
    if structured || value.len() > INLINE_VALUE_MAX || value.contains('\n') {
        format!("- `{key}`:\n\n```\n{value}\n```\n")
    } else {
        format!("- `{key}`: {value}\n")
    }
}

fn timeline_table(history: &[Fact]) -> String {
    let mut out = String::from("\n  | from | to | value |\n  |---|---|---|\n");
    // newest first, truncated
    for f in history.iter().rev().take(TIMELINE_ROWS) {
        out.push_str(&format!(
            "  | {} | {} | {} |\n",
            f.start_time.format("%Y-%m-%d"),
            f.end_time
                .map(|t| t.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| "—".to_string()),
            truncate(&f.value.replace('|', "\\|").replace('\n', " "), 60),
        ));
    }
    out.push('\n');
    out
}

fn category_index(groups: &BTreeMap<String, Vec<&Fact>>, title: &str) -> String {
    let mut ranked: Vec<(&String, usize)> = groups.iter().map(|(c, m)| (c, m.len())).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));

    let mut out = format!("# Index — {title}\n\n");
    for (cat, count) in ranked {
        out.push_str(&format!("- [{cat}]({cat}.md): {count}\n"));
    }
    out
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}…")
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use engram_store::NewFact;

    fn seeded_store() -> FactStore {
        let store = FactStore::open_in_memory().unwrap();
        let rows = [
            ("user.name", "Ada", 100),
            ("user.city", "Taipei", 200),
            ("user.editor.primary", "vscode", 300),
            ("project.lang", "rust", 400),
            ("agent.case.test_failure.ab12", r#"{"problem":"tests red"}"#, 500),
        ];
        for (k, v, secs) in rows {
            store
                .upsert(&NewFact {
                    key: k.to_string(),
                    value: v.to_string(),
                    source: "test".to_string(),
                    start_time: Utc.timestamp_opt(1_767_225_600 + secs, 0).unwrap(),
                })
                .unwrap();
        }
        store
    }

    #[test]
    fn digest_counts_and_samples() {
        let store = seeded_store();
        let mut config = EngramConfig::default();
        config.digest.min_count_for_l0 = 1;
        let digest = Aggregator::new(&store, &config).digest().unwrap();

        assert_eq!(digest["total_facts"], 5);
        assert_eq!(digest["categories"]["user"]["count"], 3);
        assert_eq!(digest["categories"]["project"]["count"], 1);
        let samples = digest["categories"]["user"]["facts"].as_object().unwrap();
        assert!(samples.len() <= config.digest.samples_per_category);
    }

    #[test]
    fn digest_folds_small_categories_unless_pinned() {
        let store = seeded_store();
        let mut config = EngramConfig::default();
        config.digest.min_count_for_l0 = 3;
        let digest = Aggregator::new(&store, &config).digest().unwrap();
        assert!(digest["categories"]["user"].is_object());
        assert!(digest["categories"]["project"].is_null());

        config.digest.pinned_keys = vec!["project.lang".to_string()];
        let digest = Aggregator::new(&store, &config).digest().unwrap();
        assert!(digest["categories"]["project"].is_object());
    }

    #[test]
    fn summary_line_shape() {
        let store = seeded_store();
        let config = EngramConfig::default();
        let line = Aggregator::new(&store, &config).summary_line().unwrap();
        assert!(line.contains("5 facts"));
        assert!(line.contains("user(3)"));
    }

    #[test]
    fn daily_log_groups_by_category_and_segment() {
        let store = seeded_store();
        let config = EngramConfig::default();
        let date = Utc.timestamp_opt(1_767_225_700, 0).unwrap().date_naive();
        let md = Aggregator::new(&store, &config)
            .daily_markdown(date)
            .unwrap()
            .unwrap();
        assert!(md.contains("## user"));
        assert!(md.contains("- `user.city`: Taipei"));
        // structured value gets a fenced block
        assert!(md.contains("```\n{\"problem\":\"tests red\"}\n```"));

        let empty = Aggregator::new(&store, &config)
            .daily_markdown(NaiveDate::from_ymd_opt(1999, 1, 1).unwrap())
            .unwrap();
        assert!(empty.is_none());
    }

    #[test]
    fn topics_include_timeline_for_changed_keys() {
        let store = seeded_store();
        store
            .upsert(&NewFact {
                key: "user.city".to_string(),
                value: "Hsinchu".to_string(),
                source: "test".to_string(),
                start_time: Utc.timestamp_opt(1_767_312_000, 0).unwrap(),
            })
            .unwrap();

        let config = EngramConfig::default();
        let dir = tempfile::tempdir().unwrap();
        let written = Aggregator::new(&store, &config)
            .write_topics(dir.path())
            .unwrap();
        assert!(written.iter().any(|p| p.ends_with("user.md")));
        assert!(written.iter().any(|p| p.ends_with("index.md")));

        let user_md = std::fs::read_to_string(dir.path().join("user.md")).unwrap();
        assert!(user_md.contains("Hsinchu"));
        assert!(user_md.contains("| from | to | value |"));
        let index = std::fs::read_to_string(dir.path().join("index.md")).unwrap();
        assert!(index.contains("[user](user.md): 3"));
    }

    #[test]
    fn weekly_snapshot_filters_by_iso_week() {
        let store = seeded_store();
        let config = EngramConfig::default();
        let dir = tempfile::tempdir().unwrap();

        let ts = Utc.timestamp_opt(1_767_225_700, 0).unwrap();
        let iso = ts.iso_week();
        let written = Aggregator::new(&store, &config)
            .write_weekly(dir.path(), iso.year(), iso.week())
            .unwrap();
        assert!(!written.is_empty());

        // a week with no facts still writes an (empty) index
        let written = Aggregator::new(&store, &config)
            .write_weekly(dir.path(), 1999, 1)
            .unwrap();
        assert_eq!(written.len(), 1);
    }
}
