// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Tracing runtime control.

use ordermap::OrderMap;
use parking_lot::Mutex;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, Registry, prelude::*, reload};

use crate::LevelFilter;
use crate::targets::TRACE_TARGETS;
use crate::trace_target;

trace_target!("tracectl", LevelFilter::INFO, &[]);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TraceCtlError {
    #[error("Invalid tracing directive '{0}': expected tag=level")]
    MissingLevel(String),
    #[error("Invalid level '{level}' for tag '{tag}'")]
    BadLevel { tag: String, level: String },
}

#[derive(Debug, Clone)]
pub struct TargetCfg {
    pub target: &'static str,
    pub name: &'static str,
    pub level: LevelFilter,
    pub tags: Vec<&'static str>,
}

#[derive(Debug)]
pub(crate) struct TargetDb {
    pub(crate) default: LevelFilter,
    pub(crate) targets: OrderMap<&'static str, TargetCfg>,
    pub(crate) tags: OrderMap<&'static str, Vec<&'static str>>,
}

impl TargetDb {
    fn from_registry(default: LevelFilter) -> Self {
        let mut db = Self {
            default,
            targets: OrderMap::new(),
            tags: OrderMap::new(),
        };
        for t in TRACE_TARGETS {
            db.register(t.target, t.name, t.level, t.tags);
        }
        db
    }

    fn register(
        &mut self,
        target: &'static str,
        name: &'static str,
        level: LevelFilter,
        tags: &'static [&'static str],
    ) {
        // the name always works as a tag
        let mut all_tags = tags.to_vec();
        if !all_tags.contains(&name) {
            all_tags.push(name);
        }
        for tag in &all_tags {
            let members = self.tags.entry(*tag).or_default();
            if !members.contains(&target) {
                members.push(target);
            }
        }
        let cfg = TargetCfg {
            target,
            name,
            level,
            tags: all_tags,
        };
        if self.targets.insert(target, cfg).is_some() {
            warn!("Tracing target {target} declared more than once");
        }
    }

    fn env_filter(&self) -> EnvFilter {
        let mut filter = EnvFilter::new(self.default.to_string());
        for t in self.targets.values() {
            match format!("{}={}", t.target, t.level).parse() {
                Ok(directive) => filter = filter.add_directive(directive),
                Err(e) => warn!("Skipping tracing target {}: {e}", t.target),
            }
        }
        filter
    }

    fn set_tag_level(&mut self, tag: &str, level: LevelFilter) -> usize {
        let Some(members) = self.tags.get(tag) else {
            return 0;
        };
        let mut changed = 0;
        for target in members {
            if let Some(cfg) = self.targets.get_mut(target)
                && cfg.level != level
            {
                cfg.level = level;
                changed += 1;
            }
        }
        changed
    }
}

impl Display for TargetDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{:<40} {:<6} TAGS", "TARGET", "LEVEL")?;
        for t in self.targets.values() {
            writeln!(f, "{:<40} {:<6} {}", t.target, t.level, t.tags.join(","))?;
        }
        write!(f, "{:<40} {:<6}", "(default)", self.default)
    }
}

pub struct TracingControl {
    db: Mutex<TargetDb>,
    reload_handle: reload::Handle<EnvFilter, Registry>,
}

static TRACING_CTL: OnceLock<TracingControl> = OnceLock::new();

/// Get the process-wide [`TracingControl`], installing the subscriber on first call.
pub fn get_trace_ctl() -> &'static TracingControl {
    TRACING_CTL.get_or_init(TracingControl::new)
}

impl TracingControl {
    fn new() -> Self {
        let db = TargetDb::from_registry(LevelFilter::INFO);
        let (filter, reload_handle) = reload::Layer::new(db.env_filter());
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_line_number(true)
            .with_thread_names(true);

        // another subscriber may already be installed (e.g. by a test harness)
        if let Err(e) = tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .with(tracing_error::ErrorLayer::default())
            .try_init()
        {
            eprintln!("tracing subscriber already installed: {e}");
        }
        Self {
            db: Mutex::new(db),
            reload_handle,
        }
    }

    fn reload(&self, db: &TargetDb) {
        if let Err(e) = self.reload_handle.reload(db.env_filter()) {
            error!("Failed to reload tracing filter: {e}");
        }
    }

    pub fn init() {
        get_trace_ctl();
    }

    pub fn set_tag_level(&self, tag: &str, level: LevelFilter) {
        let mut db = self.db.lock();
        let changed = db.set_tag_level(tag, level);
        if changed > 0 {
            self.reload(&db);
        }
        info!("Log level for tag '{tag}' set to {level} ({changed} targets changed)");
    }

    pub fn set_level_all(&self, level: LevelFilter) {
        let mut db = self.db.lock();
        db.targets.values_mut().for_each(|t| t.level = level);
        self.reload(&db);
    }

    pub fn set_default_level(&self, level: LevelFilter) {
        let mut db = self.db.lock();
        if db.default != level {
            db.default = level;
            self.reload(&db);
        }
    }

    #[must_use]
    pub fn default_level(&self) -> LevelFilter {
        self.db.lock().default
    }

    fn parse(input: &str) -> Result<Vec<(String, LevelFilter)>, TraceCtlError> {
        input
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| {
                let (tag, level) = item
                    .split_once('=')
                    .ok_or_else(|| TraceCtlError::MissingLevel(item.to_string()))?;
                let (tag, level) = (tag.trim(), level.trim());
                let level = LevelFilter::from_str(level).map_err(|_| TraceCtlError::BadLevel {
                    tag: tag.to_string(),
                    level: level.to_string(),
                })?;
                Ok((tag.to_string(), level))
            })
            .collect()
    }

    /// Apply a comma-separated list of `tag=level`.
    ///
    /// `default` sets the level of unlisted targets and `all` sets every declared target.
    /// Tags are applied after both, so `all=warn,flow=debug` works as expected.
    ///
    /// # Errors
    ///
    /// Fails without applying anything if any item is malformed.
    pub fn setup_from_string(&self, input: &str) -> Result<(), TraceCtlError> {
        let directives = Self::parse(input)?;
        for (tag, level) in &directives {
            match tag.as_str() {
                "default" => self.set_default_level(*level),
                "all" => self.set_level_all(*level),
                _ => {}
            }
        }
        directives
            .iter()
            .filter(|(tag, _)| tag != "default" && tag != "all")
            .for_each(|(tag, level)| self.set_tag_level(tag, *level));
        Ok(())
    }

    #[must_use]
    pub fn target(&self, target: &str) -> Option<TargetCfg> {
        self.db.lock().targets.get(target).cloned()
    }

    #[must_use]
    pub fn targets(&self) -> Vec<TargetCfg> {
        self.db.lock().targets.values().cloned().collect()
    }

    #[must_use]
    pub fn targets_by_tag(&self, tag: &str) -> Vec<TargetCfg> {
        let db = self.db.lock();
        db.tags
            .get(tag)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|t| db.targets.get(t).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn tags(&self) -> Vec<&'static str> {
        self.db.lock().tags.keys().copied().collect()
    }

    pub fn dump(&self) {
        let db = self.db.lock();
        info!("\n{db}");
    }

    pub fn dump_targets_by_tag(&self) {
        let db = self.db.lock();
        let mut out = String::new();
        for (tag, members) in &db.tags {
            out += &format!("\n {tag}: {}", members.join(", "));
        }
        info!("Tracing targets by tag:{out}");
    }
}

#[cfg(test)]
mod tests {
    use super::{TargetDb, TraceCtlError, TracingControl, get_trace_ctl};
    use crate::{LevelFilter, custom_target};
    use serial_test::serial;

    custom_target!("tracectl-test-a", LevelFilter::DEBUG, &["tracectl-test"]);
    custom_target!("tracectl-test-b", LevelFilter::ERROR, &["tracectl-test"]);

    #[test]
    fn registry_collects_declared_targets() {
        let db = TargetDb::from_registry(LevelFilter::WARN);
        assert!(db.targets.contains_key("tracectl-test-a"));
        assert!(db.targets.contains_key(module_path!().trim_end_matches("::tests")));
        let members = db.tags.get("tracectl-test").cloned().unwrap_or_default();
        assert_eq!(members.len(), 2);
        // name is a tag too
        assert_eq!(db.tags.get("tracectl-test-a").map(Vec::len), Some(1));
    }

    #[test]
    fn parse_rejects_malformed_input() {
        assert_eq!(
            TracingControl::parse("flow=debug, nexthop"),
            Err(TraceCtlError::MissingLevel("nexthop".to_string()))
        );
        assert!(matches!(
            TracingControl::parse("flow=loud"),
            Err(TraceCtlError::BadLevel { .. })
        ));
        let ok = TracingControl::parse("default=warn, flow=trace,").unwrap();
        assert_eq!(ok.len(), 2);
        assert_eq!(ok[1], ("flow".to_string(), LevelFilter::TRACE));
    }

    #[test]
    #[serial]
    fn tag_levels_apply_to_all_members() {
        let tctl = get_trace_ctl();
        tctl.set_tag_level("tracectl-test", LevelFilter::OFF);
        for t in tctl.targets_by_tag("tracectl-test") {
            assert_eq!(t.level, LevelFilter::OFF);
        }
        tctl.setup_from_string("all=warn,tracectl-test-a=trace").unwrap();
        assert_eq!(
            tctl.target("tracectl-test-a").map(|t| t.level),
            Some(LevelFilter::TRACE)
        );
        assert_eq!(
            tctl.target("tracectl-test-b").map(|t| t.level),
            Some(LevelFilter::WARN)
        );
        assert!(tctl.setup_from_string("tracectl-test=nope").is_err());
        tctl.dump();
        tctl.dump_targets_by_tag();
    }

    #[test]
    #[serial]
    fn default_level() {
        let tctl = get_trace_ctl();
        tctl.set_default_level(LevelFilter::DEBUG);
        assert_eq!(tctl.default_level(), LevelFilter::DEBUG);
        tctl.setup_from_string("default=info").unwrap();
        assert_eq!(tctl.default_level(), LevelFilter::INFO);
    }
}
