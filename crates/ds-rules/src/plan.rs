use std::collections::HashSet;

use ds_core::{CardDescriptor, Source};

/// Terminal aggregation card present in every plan.
pub const FULL_REPORT: &str = "full_report";

/// Deterministic card planner.
///
/// For the same `(source, requested_cards)` the plan is identical: same
/// descriptors, same order. Nodes prefixed `resource.` are internal fetch
/// stages whose outputs several user-facing cards consume.
#[derive(Debug, Clone, Default)]
pub struct RulesEngine;

impl RulesEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn build_plan(
        &self,
        source: Source,
        requested_cards: Option<&[String]>,
    ) -> Vec<CardDescriptor> {
        build_plan(source, requested_cards)
    }
}

/// Build the initial card plan for a source.
///
/// `requested_cards` filters user-facing cards; resource dependencies are
/// included transitively and `full_report` is always kept.
pub fn build_plan(source: Source, requested_cards: Option<&[String]>) -> Vec<CardDescriptor> {
    let full = match source {
        Source::Github => github_plan(),
        Source::Scholar => scholar_plan(),
        Source::Linkedin => linkedin_plan(),
    };

    let Some(requested) = requested_cards else {
        return full;
    };
    let requested: HashSet<&str> = requested.iter().map(|s| s.as_str()).collect();

    // Keep requested user cards (plus full_report), then close over resource
    // dependencies so every kept card can still run.
    let mut keep: HashSet<String> = full
        .iter()
        .filter(|d| {
            !d.card_type.starts_with("resource.")
                && (d.card_type == FULL_REPORT || requested.contains(d.card_type.as_str()))
        })
        .map(|d| d.card_type.clone())
        .collect();

    loop {
        let mut grew = false;
        for descriptor in &full {
            if !keep.contains(&descriptor.card_type) {
                continue;
            }
            for dep in &descriptor.depends_on {
                if keep.insert(dep.clone()) {
                    grew = true;
                }
            }
        }
        if !grew {
            break;
        }
    }

    let mut out: Vec<CardDescriptor> = full
        .into_iter()
        .filter(|d| keep.contains(&d.card_type))
        .collect();

    // full_report aggregates whatever user cards survived the filter.
    for descriptor in &mut out {
        if descriptor.card_type == FULL_REPORT {
            descriptor.depends_on.retain(|d| keep.contains(d));
        }
    }
    out
}

fn github_plan() -> Vec<CardDescriptor> {
    vec![
        CardDescriptor::new("resource.github.profile").group("scrape:github"),
        CardDescriptor::new("resource.github.preview")
            .depends_on(&["resource.github.profile"])
            .group("scrape:github"),
        CardDescriptor::new("resource.github.data")
            .depends_on(&["resource.github.profile"])
            .group("scrape:github"),
        CardDescriptor::new("resource.github.enrich")
            .depends_on(&["resource.github.data"])
            .group("llm"),
        CardDescriptor::new("profile").depends_on(&["resource.github.profile"]),
        CardDescriptor::new("activity").depends_on(&["resource.github.data"]),
        CardDescriptor::new("repos")
            .depends_on(&["resource.github.data"])
            .group("llm"),
        CardDescriptor::new("role_model")
            .depends_on(&["resource.github.enrich"])
            .group("llm"),
        CardDescriptor::new("roast")
            .depends_on(&["resource.github.enrich"])
            .group("llm"),
        CardDescriptor::new("summary")
            .depends_on(&["resource.github.enrich"])
            .group("llm"),
        CardDescriptor::new(FULL_REPORT).depends_on(&[
            "profile",
            "activity",
            "repos",
            "role_model",
            "roast",
            "summary",
        ]),
    ]
}

fn scholar_plan() -> Vec<CardDescriptor> {
    vec![
        CardDescriptor::new("resource.scholar.page0").group("scrape:scholar"),
        // Background full fetch: incremental paper append + cache warm-up.
        CardDescriptor::new("resource.scholar.full")
            .depends_on(&["resource.scholar.page0"])
            .priority(1)
            .group("scrape:scholar"),
        CardDescriptor::new("resource.scholar.level")
            .depends_on(&["resource.scholar.page0"])
            .group("llm"),
        CardDescriptor::new("researcherInfo").depends_on(&["resource.scholar.page0"]),
        CardDescriptor::new("publicationStats").depends_on(&["resource.scholar.page0"]),
        CardDescriptor::new("roleModel").depends_on(&["resource.scholar.level"]),
        CardDescriptor::new("estimatedSalary").depends_on(&["resource.scholar.level"]),
        CardDescriptor::new("criticalReview")
            .depends_on(&["resource.scholar.page0"])
            .group("llm"),
        CardDescriptor::new("summary")
            .depends_on(&["resource.scholar.page0"])
            .group("llm"),
        CardDescriptor::new(FULL_REPORT).depends_on(&[
            "researcherInfo",
            "publicationStats",
            "roleModel",
            "estimatedSalary",
            "criticalReview",
            "summary",
        ]),
    ]
}

fn linkedin_plan() -> Vec<CardDescriptor> {
    vec![
        CardDescriptor::new("resource.linkedin.preview").group("scrape:linkedin"),
        CardDescriptor::new("resource.linkedin.raw_profile")
            .depends_on(&["resource.linkedin.preview"])
            .group("scrape:linkedin"),
        CardDescriptor::new("resource.linkedin.enrich")
            .depends_on(&["resource.linkedin.raw_profile"])
            .group("llm"),
        CardDescriptor::new("profile").depends_on(&["resource.linkedin.raw_profile"]),
        CardDescriptor::new("skills").depends_on(&["resource.linkedin.enrich"]),
        CardDescriptor::new("career").depends_on(&["resource.linkedin.enrich"]),
        CardDescriptor::new("role_model").depends_on(&["resource.linkedin.enrich"]),
        CardDescriptor::new("money").depends_on(&["resource.linkedin.enrich"]),
        CardDescriptor::new("roast")
            .depends_on(&["resource.linkedin.raw_profile"])
            .group("llm"),
        CardDescriptor::new("summary")
            .depends_on(&["resource.linkedin.enrich"])
            .group("llm"),
        CardDescriptor::new(FULL_REPORT).depends_on(&[
            "profile",
            "skills",
            "career",
            "role_model",
            "money",
            "roast",
            "summary",
        ]),
    ]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn types(plan: &[CardDescriptor]) -> Vec<&str> {
        plan.iter().map(|d| d.card_type.as_str()).collect()
    }

    #[test]
    fn plans_are_deterministic() {
        for source in [Source::Github, Source::Scholar, Source::Linkedin] {
            assert_eq!(build_plan(source, None), build_plan(source, None));
        }
    }

    #[test]
    fn every_plan_ends_with_full_report() {
        for source in [Source::Github, Source::Scholar, Source::Linkedin] {
            let plan = build_plan(source, None);
            assert_eq!(plan.last().unwrap().card_type, FULL_REPORT);
        }
    }

    #[test]
    fn dependencies_reference_cards_in_plan() {
        for source in [Source::Github, Source::Scholar, Source::Linkedin] {
            let plan = build_plan(source, None);
            let known: HashSet<&str> = types(&plan).into_iter().collect();
            for descriptor in &plan {
                for dep in &descriptor.depends_on {
                    assert!(
                        known.contains(dep.as_str()),
                        "{source}: {} depends on unknown {dep}",
                        descriptor.card_type
                    );
                }
            }
        }
    }

    #[test]
    fn github_plan_shape() {
        let plan = build_plan(Source::Github, None);
        let types = types(&plan);
        assert!(types.contains(&"resource.github.profile"));
        assert!(types.contains(&"resource.github.enrich"));
        assert!(types.contains(&"roast"));

        let enrich = plan
            .iter()
            .find(|d| d.card_type == "resource.github.enrich")
            .unwrap();
        assert_eq!(enrich.concurrency_group, "llm");
        assert_eq!(enrich.depends_on, vec!["resource.github.data"]);
    }

    #[test]
    fn scholar_full_fetch_is_background() {
        let plan = build_plan(Source::Scholar, None);
        let full = plan
            .iter()
            .find(|d| d.card_type == "resource.scholar.full")
            .unwrap();
        assert_eq!(full.priority, 1);
    }

    #[test]
    fn requested_cards_filter_keeps_resource_closure() {
        let requested = vec!["roast".to_string()];
        let plan = build_plan(Source::Github, Some(&requested));
        let types = types(&plan);

        assert!(types.contains(&"roast"));
        assert!(types.contains(&"resource.github.enrich"));
        assert!(types.contains(&"resource.github.data"));
        assert!(types.contains(&"resource.github.profile"));
        assert!(types.contains(&FULL_REPORT));
        assert!(!types.contains(&"role_model"));
        assert!(!types.contains(&"activity"));

        let report = plan.iter().find(|d| d.card_type == FULL_REPORT).unwrap();
        assert_eq!(report.depends_on, vec!["roast"]);
    }
}
