//! Template engine for resolving task configuration

use super::context::TemplateContext;
use super::errors::TemplateError;
use super::filters;
use crate::config::ConfigMap;
use minijinja::Environment;

/// A variable path a template reads, split at the namespace
///
/// `{{ tasks.extract.stdout }}` yields namespace `tasks`, name `extract`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Reference {
    pub namespace: String,
    pub name: Option<String>,
}

impl Reference {
    fn parse(path: &str) -> Self {
        let mut parts = path.splitn(3, '.');
        let namespace = parts.next().unwrap_or_default().to_string();
        let name = parts.next().map(str::to_string);
        Self { namespace, name }
    }
}

/// Template rendering engine
///
/// Wraps minijinja with custom filters and strict undefined handling.
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);
        filters::register_filters(&mut env);
        Self { env }
    }

    /// Render a template string with the given context
    ///
    /// # Example
    ///
    /// ```ignore
    /// let engine = TemplateEngine::new();
    /// let ctx = TemplateContext::with_vars(ConfigMap::new().with("target", "prod"));
    ///
    /// let result = engine.render("load --to {{ vars.target }}", &ctx)?;
    /// assert_eq!(result, "load --to prod");
    /// ```
    pub fn render(&self, template: &str, ctx: &TemplateContext) -> Result<String, TemplateError> {
        if !is_template(template) {
            return Ok(template.to_string());
        }
        self.env
            .render_str(template, ctx.to_value())
            .map_err(|e| TemplateError::from_minijinja(e, &ctx.known_variables()))
    }

    /// Render every string leaf of a config mapping
    pub fn render_config(
        &self,
        config: &ConfigMap,
        ctx: &TemplateContext,
    ) -> Result<ConfigMap, TemplateError> {
        config.try_map_str(&mut |s| self.render(s, ctx))
    }

    /// Check that a template parses
    pub fn validate(&self, template: &str) -> Result<(), TemplateError> {
        // Scratch environment, borrows `template` for the parse only
        let env = Environment::new();
        env.template_from_str(template)
            .map(|_| ())
            .map_err(|e| TemplateError::from_minijinja(e, &[]))
    }

    /// Variables a template reads from its context, sorted and deduplicated
    pub fn references(&self, template: &str) -> Result<Vec<Reference>, TemplateError> {
        if !is_template(template) {
            return Ok(Vec::new());
        }
        let env = Environment::new();
        let tmpl = env
            .template_from_str(template)
            .map_err(|e| TemplateError::from_minijinja(e, &[]))?;

        let mut refs: Vec<Reference> = tmpl
            .undeclared_variables(true)
            .iter()
            .map(|path| Reference::parse(path))
            .collect();
        refs.sort();
        refs.dedup();
        Ok(refs)
    }
}

fn is_template(s: &str) -> bool {
    s.contains("{{") || s.contains("{%") || s.contains("{#")
}
