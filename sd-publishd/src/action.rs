use shared::types::ServiceRecord;

/// A requested mutation of the published service set.
/// Actions are the only way anything outside the controller changes the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Add(ServiceRecord),
    Delete(ServiceRecord),
    Quit,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Add(_) => "add",
            Action::Delete(_) => "delete",
            Action::Quit => "quit",
        }
    }
}
