//! Resource resolver - read-time inheritance of career-global resources
//!
//! Nothing here touches storage. Local step resources always win: a global
//! resource is inherited only if no item already in the step's list shares
//! its title or its URL (exact, case-sensitive).

use serde::Serialize;

use crate::db::{Career, GlobalResource, Resource, ResourceCategory, ResourceLists, RoadmapStep};

/// A resource as displayed, tagged with where it came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedResource {
    pub title: String,
    pub url: String,
    pub inherited: bool,
}

/// Whether a step inherits any global resources at all
pub fn inherits_globals(step: &RoadmapStep, career: &Career) -> bool {
    step.allow_global_resources && !step.is_frozen() && !career.is_frozen()
}

/// Effective resource lists for `step`
pub fn resolve(step: &RoadmapStep, career: &Career) -> ResourceLists<ResolvedResource> {
    let inherit = inherits_globals(step, career);
    let mut resolved = ResourceLists::default();

    for category in ResourceCategory::ALL {
        let globals: &[GlobalResource] = if inherit {
            career.resources.get(category)
        } else {
            &[]
        };
        *resolved.get_mut(category) = merge(&step.id, step.resources.get(category), globals);
    }

    resolved
}

/// Merge one category: locals first, then applicable globals in career order
pub fn merge(step_id: &str, local: &[Resource], globals: &[GlobalResource]) -> Vec<ResolvedResource> {
    let mut merged: Vec<ResolvedResource> = local
        .iter()
        .map(|r| ResolvedResource {
            title: r.title.clone(),
            url: r.url.clone(),
            inherited: false,
        })
        .collect();

    for global in globals {
        if !global.applies_to.includes(step_id) {
            continue;
        }
        let shadowed = merged
            .iter()
            .any(|existing| existing.title == global.title || existing.url == global.url);
        if shadowed {
            continue;
        }
        merged.push(ResolvedResource {
            title: global.title.clone(),
            url: global.url.clone(),
            inherited: true,
        });
    }

    merged
}
