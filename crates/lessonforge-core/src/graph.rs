use std::collections::HashMap;

use serde::Serialize;
use tracing::debug;

use crate::field::{Field, FieldId, Section};
use crate::generation_config::GenerationConfig;
use crate::overrides::ConfigOverrideStore;
use crate::{LessonForgeError, Result};

/// Static description of a lesson's fields and their declared dependencies.
#[derive(Debug, Clone, Serialize)]
pub struct FieldGraph {
    fields: Vec<Field>,
    #[serde(skip)]
    index: HashMap<FieldId, usize>,
}

impl FieldGraph {
    /// Build the graph, rejecting duplicate ids and dependencies on fields
    /// that do not exist.
    pub fn new(fields: Vec<Field>) -> Result<Self> {
        let mut index = HashMap::with_capacity(fields.len());
        for (i, field) in fields.iter().enumerate() {
            if index.insert(field.id.clone(), i).is_some() {
                return Err(LessonForgeError::DuplicateField(field.id.clone()));
            }
        }

        let mut graph = Self { fields, index };
        for field in &mut graph.fields {
            // The declared list is the template's context selection.
            field.template_config.context_field_ids = field.context_field_ids.clone();
        }
        for field in &graph.fields {
            graph.check_references(&field.id, &field.context_field_ids)?;
        }

        debug!("Loaded field graph with {} fields", graph.fields.len());
        Ok(graph)
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, id: &FieldId) -> Option<&Field> {
        self.index.get(id).map(|&i| &self.fields[i])
    }

    pub fn require(&self, id: &FieldId) -> Result<&Field> {
        self.field(id)
            .ok_or_else(|| LessonForgeError::FieldNotFound(id.clone()))
    }

    pub fn name_of(&self, id: &FieldId) -> Option<&str> {
        self.field(id).map(|f| f.name.as_str())
    }

    pub fn contains(&self, id: &FieldId) -> bool {
        self.index.contains_key(id)
    }

    /// AI-enabled fields in generation order: every designer field by stored
    /// order, then every builder field by stored order. Equal orders keep the
    /// order the fields were loaded in.
    pub fn ordered_generation_queue(&self) -> Vec<&Field> {
        let mut queue: Vec<(usize, &Field)> = self
            .fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.ai_enabled)
            .collect();
        queue.sort_by_key(|(pos, f)| (section_rank(f.section), f.order, *pos));
        queue.into_iter().map(|(_, f)| f).collect()
    }

    /// Effective context ids for a field, honouring lesson-level overrides.
    pub fn dependencies_of(
        &self,
        field_id: &FieldId,
        overrides: &ConfigOverrideStore,
    ) -> Result<Vec<FieldId>> {
        let field = self.require(field_id)?;
        let ids = match overrides.get(field_id) {
            Some(config) => config.context_field_ids.clone(),
            None => field.template_config.context_field_ids.clone(),
        };
        self.check_references(field_id, &ids)?;
        Ok(ids)
    }

    /// Fail with `DanglingDependency` if any id is not a field of this graph.
    pub fn check_references(&self, field_id: &FieldId, ids: &[FieldId]) -> Result<()> {
        match ids.iter().find(|id| !self.contains(id)) {
            Some(missing) => Err(LessonForgeError::DanglingDependency {
                field: field_id.clone(),
                missing: missing.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Template-editing entry point. The new context selection becomes the
    /// declared dependency list; it must reference existing fields and must
    /// not close a dependency cycle.
    pub fn update_template_config(
        &mut self,
        field_id: &FieldId,
        config: GenerationConfig,
    ) -> Result<()> {
        let &pos = self
            .index
            .get(field_id)
            .ok_or_else(|| LessonForgeError::FieldNotFound(field_id.clone()))?;
        self.check_references(field_id, &config.context_field_ids)?;

        let declared = config.context_field_ids.clone();
        let previous = std::mem::replace(&mut self.fields[pos].template_config, config);
        let previous_declared =
            std::mem::replace(&mut self.fields[pos].context_field_ids, declared);

        if let Some(cycle) = self.detect_cycle() {
            self.fields[pos].template_config = previous;
            self.fields[pos].context_field_ids = previous_declared;
            return Err(LessonForgeError::CyclicDependency(cycle));
        }
        Ok(())
    }

    /// Find a dependency cycle over the declared edges, if one exists. The
    /// returned path starts and ends with the same field.
    pub fn detect_cycle(&self) -> Option<Vec<FieldId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        fn visit(
            graph: &FieldGraph,
            node: usize,
            marks: &mut [Mark],
            path: &mut Vec<usize>,
        ) -> Option<Vec<FieldId>> {
            marks[node] = Mark::InProgress;
            path.push(node);
            for dep in &graph.fields[node].context_field_ids {
                let Some(&next) = graph.index.get(dep) else {
                    continue;
                };
                match marks[next] {
                    Mark::InProgress => {
                        let start = path.iter().position(|&n| n == next).unwrap_or(0);
                        let mut cycle: Vec<FieldId> = path[start..]
                            .iter()
                            .map(|&n| graph.fields[n].id.clone())
                            .collect();
                        cycle.push(graph.fields[next].id.clone());
                        return Some(cycle);
                    }
                    Mark::Unvisited => {
                        if let Some(cycle) = visit(graph, next, marks, path) {
                            return Some(cycle);
                        }
                    }
                    Mark::Done => {}
                }
            }
            path.pop();
            marks[node] = Mark::Done;
            None
        }

        let mut marks = vec![Mark::Unvisited; self.fields.len()];
        let mut path = Vec::new();
        for node in 0..self.fields.len() {
            if marks[node] == Mark::Unvisited {
                if let Some(cycle) = visit(self, node, &mut marks, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    /// Fields whose declared context includes `field_id`.
    pub fn dependents_of(&self, field_id: &FieldId) -> Vec<&Field> {
        self.fields
            .iter()
            .filter(|f| f.context_field_ids.contains(field_id))
            .collect()
    }
}

fn section_rank(section: Section) -> u8 {
    match section {
        Section::Designer => 0,
        Section::Builder => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldType;

    fn text(id: &str) -> Field {
        Field::new(id, id.to_uppercase(), FieldType::Text)
    }

    #[test]
    fn test_queue_orders_designer_before_builder() {
        // Supplied builder-first and out of order on purpose.
        let fields = vec![
            text("b2").in_section(Section::Builder, 2).ai_enabled("b2"),
            text("d2").in_section(Section::Designer, 2).ai_enabled("d2"),
            text("b1").in_section(Section::Builder, 1).ai_enabled("b1"),
            text("manual").in_section(Section::Designer, 0),
            text("d1").in_section(Section::Designer, 1).ai_enabled("d1"),
        ];
        let graph = FieldGraph::new(fields).unwrap();
        let ids: Vec<&str> = graph
            .ordered_generation_queue()
            .iter()
            .map(|f| f.id.as_str())
            .collect();
        assert_eq!(ids, vec!["d1", "d2", "b1", "b2"]);
    }

    #[test]
    fn test_dangling_dependency_rejected() {
        let fields = vec![text("a"), text("b").depends_on(["ghost"])];
        let err = FieldGraph::new(fields).unwrap_err();
        assert!(matches!(
            err,
            LessonForgeError::DanglingDependency { ref missing, .. } if missing.as_str() == "ghost"
        ));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let err = FieldGraph::new(vec![text("a"), text("a")]).unwrap_err();
        assert!(matches!(err, LessonForgeError::DuplicateField(_)));
    }

    #[test]
    fn test_dependencies_follow_overrides() {
        let graph = FieldGraph::new(vec![
            text("a").ai_enabled("a"),
            text("c").ai_enabled("c"),
            text("b").ai_enabled("b").depends_on(["a"]),
        ])
        .unwrap();
        let mut overrides = ConfigOverrideStore::new("lesson-1");
        assert_eq!(
            graph.dependencies_of(&"b".into(), &overrides).unwrap(),
            vec![FieldId::from("a")]
        );

        let mut config = overrides.effective_config(&graph, &"b".into()).unwrap();
        config.context_field_ids = vec!["c".into()];
        overrides.apply_edit(&graph, &"b".into(), config).unwrap();
        assert_eq!(
            graph.dependencies_of(&"b".into(), &overrides).unwrap(),
            vec![FieldId::from("c")]
        );
    }

    #[test]
    fn test_template_edit_rejects_cycle() {
        let mut graph = FieldGraph::new(vec![
            text("a"),
            text("b").depends_on(["a"]),
            text("c").depends_on(["b"]),
        ])
        .unwrap();
        assert!(graph.detect_cycle().is_none());

        let mut config = GenerationConfig::with_task("a");
        config.context_field_ids = vec!["c".into()];
        let err = graph.update_template_config(&"a".into(), config).unwrap_err();
        match err {
            LessonForgeError::CyclicDependency(cycle) => {
                assert_eq!(cycle.first(), cycle.last());
                assert!(cycle.len() >= 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        // Rolled back.
        assert!(graph.field(&"a".into()).unwrap().context_field_ids.is_empty());
    }

    #[test]
    fn test_template_edit_applies() {
        let mut graph = FieldGraph::new(vec![text("a"), text("b")]).unwrap();
        let mut config = GenerationConfig::with_task("new task");
        config.context_field_ids = vec!["a".into()];
        graph.update_template_config(&"b".into(), config).unwrap();

        let b = graph.field(&"b".into()).unwrap();
        assert_eq!(b.template_config.task_prompt, "new task");
        assert_eq!(b.context_field_ids, vec![FieldId::from("a")]);
        assert_eq!(graph.dependents_of(&"a".into()).len(), 1);
    }
}
