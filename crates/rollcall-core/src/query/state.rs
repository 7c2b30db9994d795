/// Observable state of a fetch or mutation unit.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitState<T> {
    pub data: Option<T>,
    pub loading: bool,
    pub error: Option<String>,
}

impl<T> Default for UnitState<T> {
    fn default() -> Self {
        Self {
            data: None,
            loading: false,
            error: None,
        }
    }
}

impl<T> UnitState<T> {
    pub(crate) fn begin(&mut self) {
        self.loading = true;
        self.error = None;
    }
}
