//! Pipeline steps.

use std::fmt;
use std::rc::Rc;

use crate::workflow::Workflow;

/// Step body. Receives the handle to advance and the environment.
pub type StepFn<E> = Rc<dyn Fn(&Workflow<E>, &mut E)>;

/// A named unit of a workflow.
pub struct Step<E: 'static> {
    name: String,
    func: StepFn<E>,
}

impl<E: 'static> Step<E> {
    /// Create a step.
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Workflow<E>, &mut E) + 'static,
    {
        Self {
            name: name.into(),
            func: Rc::new(func),
        }
    }

    /// Get the step name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn call(&self, wf: &Workflow<E>, env: &mut E) {
        (self.func)(wf, env)
    }
}

impl<E: 'static> Clone for Step<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            func: self.func.clone(),
        }
    }
}

impl<E: 'static> fmt::Debug for Step<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Step").field(&self.name).finish()
    }
}
