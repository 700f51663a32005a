//! Classification prompt: the operator's template followed by the post.

use crate::stream::StreamItem;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    template: String,
}

impl PromptTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn render(&self, item: &StreamItem) -> String {
        format!(
            "{}\n\n---Post---\n{}\n\n{}",
            self.template,
            item.title(),
            item.body()
        )
    }
}
