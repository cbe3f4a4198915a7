//! The workflow state machine.
//!
//! ```text
//! Pending --run/next--> Running --step calls next()--> Pending --> ... --> Done
//!                          |                                          ^
//!                          +--step returns without next(): parked     |
//!                             until a completion calls next() --------+
//! ```
//!
//! `next()` from inside the running step only records the request; the
//! driver picks the following step once the current one has returned, so
//! synchronous pipelines never nest stack frames or environment borrows.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::leak::{log_leak, LeakHook, LeakReport};
use crate::step::Step;

/// Workflow lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkflowState {
    /// Has remaining steps (or a join) and no step executing.
    Pending,
    /// A step is executing.
    Running,
    /// Steps exhausted or interrupted. Terminal.
    Done,
}

type EnvUpdate<E> = Box<dyn FnOnce(&mut E)>;

struct Inner<E: 'static> {
    id: Uuid,
    name: String,
    created_at: DateTime<Utc>,
    steps: RefCell<VecDeque<Step<E>>>,
    env: RefCell<E>,
    updates: RefCell<Vec<EnvUpdate<E>>>,
    end_callbacks: RefCell<Vec<EnvUpdate<E>>>,
    state: Cell<WorkflowState>,
    started: Cell<bool>,
    advance: Cell<bool>,
    interrupted: Cell<bool>,
    current: RefCell<Option<String>>,
    leak_hook: RefCell<LeakHook>,
}

impl<E: 'static> Drop for Inner<E> {
    fn drop(&mut self) {
        let state = self.state.get();
        if state == WorkflowState::Done {
            return;
        }
        let report = LeakReport {
            id: self.id,
            name: std::mem::take(&mut self.name),
            state,
            current_step: self.current.get_mut().take(),
            remaining_steps: self
                .steps
                .get_mut()
                .iter()
                .map(|s| s.name().to_string())
                .collect(),
            pending_end_callbacks: self.end_callbacks.get_mut().len(),
            created_at: self.created_at,
        };
        let hook = self.leak_hook.get_mut().clone();
        hook(&report);
    }
}

/// Parallel branch bookkeeping.
struct Branch {
    name: String,
    join: Rc<Cell<usize>>,
    finished: Cell<bool>,
}

/// Handle to a workflow. Clones share the same pipeline.
///
/// A handle given to a parallel branch advances the branch instead of the
/// pipeline: its `next()` joins the fan-out.
pub struct Workflow<E: 'static> {
    inner: Rc<Inner<E>>,
    branch: Option<Rc<Branch>>,
}

impl<E: 'static> Clone for Workflow<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            branch: self.branch.clone(),
        }
    }
}

impl<E: 'static> Workflow<E> {
    /// Create a workflow. Nothing runs until [`run`](Self::run).
    pub fn new(name: impl Into<String>, steps: Vec<Step<E>>, env: E) -> Self {
        let name = name.into();
        let id = Uuid::new_v4();
        debug!(workflow = %id, "Created workflow {} ({} steps)", name, steps.len());
        Self {
            inner: Rc::new(Inner {
                id,
                name,
                created_at: Utc::now(),
                steps: RefCell::new(steps.into()),
                env: RefCell::new(env),
                updates: RefCell::new(Vec::new()),
                end_callbacks: RefCell::new(Vec::new()),
                state: Cell::new(WorkflowState::Pending),
                started: Cell::new(false),
                advance: Cell::new(false),
                interrupted: Cell::new(false),
                current: RefCell::new(None),
                leak_hook: RefCell::new(Rc::new(log_leak) as LeakHook),
            }),
            branch: None,
        }
    }

    /// Replace the hook receiving a [`LeakReport`] if this workflow is
    /// dropped before finishing.
    pub fn with_leak_hook<F>(self, hook: F) -> Self
    where
        F: Fn(&LeakReport) + 'static,
    {
        *self.inner.leak_hook.borrow_mut() = Rc::new(hook);
        self
    }

    /// Get the workflow ID.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Get the workflow name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Get the current state.
    pub fn state(&self) -> WorkflowState {
        self.inner.state.get()
    }

    /// Check if the workflow has finished.
    pub fn is_done(&self) -> bool {
        self.state() == WorkflowState::Done
    }

    /// Check if the workflow was interrupted.
    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.get()
    }

    /// Check if this handle belongs to a parallel branch.
    pub fn is_branch(&self) -> bool {
        self.branch.is_some()
    }

    /// Name of the step being executed or awaited.
    pub fn current_step(&self) -> Option<String> {
        self.inner.current.borrow().clone()
    }

    /// Names of the steps not yet started.
    pub fn remaining_steps(&self) -> Vec<String> {
        self.inner
            .steps
            .borrow()
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    /// Start the pipeline. A second call is ignored.
    pub fn run(&self) {
        if self.inner.started.get() {
            warn!(workflow = %self.inner.id, "{}: run() called twice", self.inner.name);
            return;
        }
        self.main().advance();
    }

    /// Advance to the next step.
    ///
    /// Called from inside the running step, the next step starts once the
    /// current one returns. Called from a completion, it runs immediately.
    pub fn next(&self) {
        match &self.branch {
            Some(branch) => self.join_branch(branch),
            None => self.advance(),
        }
    }

    /// Update the environment, then advance.
    pub fn next_with<F>(&self, update: F)
    where
        F: FnOnce(&mut E) + 'static,
    {
        self.update_env(update);
        self.next();
    }

    /// Modify the environment.
    ///
    /// While a step holds the environment the update is applied right after
    /// that step returns.
    pub fn update_env<F>(&self, update: F)
    where
        F: FnOnce(&mut E) + 'static,
    {
        match self.inner.env.try_borrow_mut() {
            Ok(mut env) => update(&mut env),
            Err(_) => self.inner.updates.borrow_mut().push(Box::new(update)),
        }
    }

    /// Read the environment. Returns `None` while a step holds it.
    pub fn with_env<R>(&self, read: impl FnOnce(&E) -> R) -> Option<R> {
        self.inner.env.try_borrow().ok().map(|env| read(&env))
    }

    /// Insert steps to run right after the current one, in the given order.
    pub fn insert_steps(&self, steps: Vec<Step<E>>) {
        if self.refuse_steps("insert", steps.len()) {
            return;
        }
        let mut queue = self.inner.steps.borrow_mut();
        for step in steps.into_iter().rev() {
            queue.push_front(step);
        }
    }

    /// Append steps at the end of the pipeline.
    pub fn append_steps(&self, steps: Vec<Step<E>>) {
        if self.refuse_steps("append", steps.len()) {
            return;
        }
        self.inner.steps.borrow_mut().extend(steps);
    }

    /// Insert a fan-out right after the current step.
    ///
    /// Every branch starts in turn with its own handle; the pipeline resumes
    /// once each branch has called `next()` on that handle. Branches have no
    /// relative ordering guarantee.
    pub fn insert_parallel_steps(&self, branches: Vec<Step<E>>) {
        let names: Vec<&str> = branches.iter().map(|b| b.name()).collect();
        let label = format!("parallel[{}]", names.join(", "));
        let fan_out = Step::new(label, move |wf: &Workflow<E>, env: &mut E| {
            if branches.is_empty() {
                wf.next();
                return;
            }
            let join = Rc::new(Cell::new(branches.len()));
            for branch in &branches {
                if wf.is_interrupted() {
                    break;
                }
                let handle = Workflow {
                    inner: wf.inner.clone(),
                    branch: Some(Rc::new(Branch {
                        name: branch.name().to_string(),
                        join: join.clone(),
                        finished: Cell::new(false),
                    })),
                };
                branch.call(&handle, env);
            }
        });
        self.insert_steps(vec![fan_out]);
    }

    /// Drop the remaining steps and finish. End callbacks fire exactly as on
    /// normal completion; no further step runs.
    pub fn interrupt(&self) {
        let inner = &self.inner;
        let state = inner.state.get();
        if state == WorkflowState::Done {
            return;
        }
        let skipped = inner.steps.borrow_mut().drain(..).count();
        inner.interrupted.set(true);
        debug!(workflow = %inner.id, "{}: interrupted, {} steps skipped", inner.name, skipped);
        match state {
            WorkflowState::Running => inner.advance.set(true),
            _ => self.main().finish(),
        }
    }

    /// Register a callback for completion. Callbacks fire once, in
    /// registration order; registering on a finished workflow runs the
    /// callback immediately.
    pub fn on_end<F>(&self, callback: F)
    where
        F: FnOnce(&mut E) + 'static,
    {
        if self.is_done() {
            if let Ok(mut env) = self.inner.env.try_borrow_mut() {
                callback(&mut env);
                return;
            }
        }
        self.inner.end_callbacks.borrow_mut().push(Box::new(callback));
    }

    /// Advance this workflow once `other` has finished.
    ///
    /// Starts this workflow if it has not run yet.
    pub fn continue_after<F: 'static>(&self, other: &Workflow<F>) {
        debug!(
            workflow = %self.inner.id,
            "{}: continuing after {}",
            self.inner.name,
            other.name()
        );
        let this = self.clone();
        other.on_end(move |_| this.next());
    }

    // ========================================================================
    // Driver
    // ========================================================================

    fn main(&self) -> Workflow<E> {
        Workflow {
            inner: self.inner.clone(),
            branch: None,
        }
    }

    fn advance(&self) {
        let inner = &self.inner;
        match inner.state.get() {
            WorkflowState::Done => {
                if inner.interrupted.get() {
                    debug!(workflow = %inner.id, "{}: next() after interrupt ignored", inner.name);
                } else {
                    warn!(workflow = %inner.id, "{}: next() on a finished workflow", inner.name);
                }
                return;
            }
            WorkflowState::Running => {
                inner.advance.set(true);
                return;
            }
            WorkflowState::Pending => {}
        }
        inner.started.set(true);

        loop {
            let step = inner.steps.borrow_mut().pop_front();
            let Some(step) = step else {
                self.finish();
                return;
            };

            debug!(workflow = %inner.id, "{}: step {}", inner.name, step.name());
            inner.state.set(WorkflowState::Running);
            inner.advance.set(false);
            *inner.current.borrow_mut() = Some(step.name().to_string());
            {
                let mut env = inner.env.borrow_mut();
                step.call(self, &mut env);
            }
            self.flush_updates();
            inner.state.set(WorkflowState::Pending);

            if !inner.advance.replace(false) {
                debug!(workflow = %inner.id, "{}: waiting in {}", inner.name, step.name());
                return;
            }
        }
    }

    fn join_branch(&self, branch: &Branch) {
        if branch.finished.replace(true) {
            warn!(
                workflow = %self.inner.id,
                "{}: branch {} advanced twice",
                self.inner.name,
                branch.name
            );
            return;
        }
        let left = branch.join.get().saturating_sub(1);
        branch.join.set(left);
        debug!(
            workflow = %self.inner.id,
            "{}: branch {} joined, {} outstanding",
            self.inner.name,
            branch.name,
            left
        );
        if left == 0 {
            self.main().advance();
        }
    }

    fn finish(&self) {
        let inner = &self.inner;
        inner.state.set(WorkflowState::Done);
        inner.current.borrow_mut().take();
        self.flush_updates();
        debug!(
            workflow = %inner.id,
            interrupted = inner.interrupted.get(),
            "{}: done",
            inner.name
        );

        loop {
            let callbacks = std::mem::take(&mut *inner.end_callbacks.borrow_mut());
            if callbacks.is_empty() {
                break;
            }
            {
                let mut env = inner.env.borrow_mut();
                for callback in callbacks {
                    callback(&mut env);
                }
            }
            self.flush_updates();
        }
    }

    fn flush_updates(&self) {
        loop {
            let updates = std::mem::take(&mut *self.inner.updates.borrow_mut());
            if updates.is_empty() {
                return;
            }
            let mut env = self.inner.env.borrow_mut();
            for update in updates {
                update(&mut env);
            }
        }
    }

    fn refuse_steps(&self, op: &str, count: usize) -> bool {
        if self.is_done() {
            warn!(
                workflow = %self.inner.id,
                "{}: {} of {} steps after completion ignored",
                self.inner.name,
                op,
                count
            );
            return true;
        }
        false
    }
}

impl<E: 'static> fmt::Debug for Workflow<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.inner.state.get())
            .field("branch", &self.branch.as_ref().map(|b| b.name.as_str()))
            .finish()
    }
}

#[cfg(test)]
#[path = "workflow_tests.rs"]
mod tests;
