//! Project routing
//!
//! Maps event categories to their destination projects. Built once from
//! validated configuration; the only runtime mutation is the main-project
//! switch performed by the anonymize protocol.

use crate::config::TrackwireConfig;
use crate::types::{EventCategory, ProjectSettings};
use std::collections::HashMap;
use std::sync::RwLock;

/// Category → ordered destination projects, falling back to the main project.
pub struct ProjectRouter {
    main: RwLock<ProjectSettings>,
    routes: HashMap<EventCategory, Vec<ProjectSettings>>,
}

impl ProjectRouter {
    pub fn from_config(config: &TrackwireConfig) -> Self {
        Self {
            main: RwLock::new(config.main_project()),
            routes: config.project_routes.clone(),
        }
    }

    /// Destinations for a category, in configured order. Never empty:
    /// unmapped categories resolve to the main project.
    pub fn resolve(&self, category: EventCategory) -> Vec<ProjectSettings> {
        match self.routes.get(&category) {
            Some(projects) if !projects.is_empty() => projects.clone(),
            _ => vec![self.main()],
        }
    }

    /// The current main project
    pub fn main(&self) -> ProjectSettings {
        self.main.read().unwrap().clone()
    }

    /// Switch the main project (anonymize with an explicit new destination)
    pub fn set_main(&self, project: ProjectSettings) {
        tracing::info!(project = %project.project_token, "Switching main project");
        *self.main.write().unwrap() = project;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router_with_payment_route() -> ProjectRouter {
        let mut config = TrackwireConfig::new("main-token");
        config.project_routes.insert(
            EventCategory::Payment,
            vec![
                ProjectSettings::new("https://billing.example.com", "billing-1", None),
                ProjectSettings::new("https://billing.example.com", "billing-2", None),
            ],
        );
        ProjectRouter::from_config(&config)
    }

    #[test]
    fn test_resolve_routed_category() {
        let router = router_with_payment_route();
        let projects = router.resolve(EventCategory::Payment);
        assert_eq!(projects.len(), 2);
        assert_eq!(projects[0].project_token, "billing-1");
        assert_eq!(projects[1].project_token, "billing-2");
    }

    #[test]
    fn test_unmapped_category_falls_back_to_main() {
        let router = router_with_payment_route();
        let projects = router.resolve(EventCategory::TrackEvent);
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].project_token, "main-token");
    }

    #[test]
    fn test_set_main_redirects_fallback_only() {
        let router = router_with_payment_route();
        router.set_main(ProjectSettings::new(
            "https://other.example.com",
            "new-main",
            None,
        ));

        assert_eq!(
            router.resolve(EventCategory::TrackEvent)[0].project_token,
            "new-main"
        );
        // Explicit routes are untouched
        assert_eq!(
            router.resolve(EventCategory::Payment)[0].project_token,
            "billing-1"
        );
    }
}
