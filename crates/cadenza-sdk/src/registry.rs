// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Name to factory registry for workflow and activity types.
//!
//! A fresh implementation instance is built per workflow run and per
//! activity invocation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::activity::{Activity, ActivityContext, FnActivity};
use crate::args::Args;
use crate::context::WorkflowContext;
use crate::error::{Result, SdkError};
use crate::types::Payload;
use crate::workflow::{FnWorkflow, Workflow};

type WorkflowFactory = Arc<dyn Fn() -> Arc<dyn Workflow> + Send + Sync>;
type ActivityFactory = Arc<dyn Fn() -> Arc<dyn Activity> + Send + Sync>;

/// Registered workflow and activity types.
#[derive(Clone, Default)]
pub struct Registry {
    workflows: HashMap<String, WorkflowFactory>,
    activities: HashMap<String, ActivityFactory>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow type. Fails if the name is taken.
    pub fn register_workflow_type<W, F>(&mut self, name: impl Into<String>, factory: F) -> Result<()>
    where
        W: Workflow,
        F: Fn() -> W + Send + Sync + 'static,
    {
        let name = name.into();
        if self.workflows.contains_key(&name) {
            return Err(SdkError::Registration(format!(
                "workflow type '{name}' is already registered"
            )));
        }
        self.workflows
            .insert(name, Arc::new(move || Arc::new(factory()) as Arc<dyn Workflow>));
        Ok(())
    }

    /// Register an activity type. Fails if the name is taken.
    pub fn register_activity_type<A, F>(&mut self, name: impl Into<String>, factory: F) -> Result<()>
    where
        A: Activity,
        F: Fn() -> A + Send + Sync + 'static,
    {
        let name = name.into();
        if self.activities.contains_key(&name) {
            return Err(SdkError::Registration(format!(
                "activity type '{name}' is already registered"
            )));
        }
        self.activities
            .insert(name, Arc::new(move || Arc::new(factory()) as Arc<dyn Activity>));
        Ok(())
    }

    /// Register a closure as a workflow type.
    pub fn register_workflow_fn<F, Fut>(&mut self, name: impl Into<String>, f: F) -> Result<()>
    where
        F: Fn(WorkflowContext, Args) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload>> + Send + 'static,
    {
        self.register_workflow_type(name, move || FnWorkflow::new(f.clone()))
    }

    /// Register a closure as an activity type.
    pub fn register_activity_fn<F, Fut>(&mut self, name: impl Into<String>, f: F) -> Result<()>
    where
        F: Fn(ActivityContext, Args) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload>> + Send + 'static,
    {
        self.register_activity_type(name, move || FnActivity::new(f.clone()))
    }

    pub fn new_workflow(&self, name: &str) -> Result<Arc<dyn Workflow>> {
        self.workflows
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| SdkError::UnknownWorkflowType(name.to_string()))
    }

    pub fn new_activity(&self, name: &str) -> Result<Arc<dyn Activity>> {
        self.activities
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| SdkError::UnknownActivityType(name.to_string()))
    }

    /// Registered workflow type names, sorted.
    pub fn workflow_types(&self) -> Vec<String> {
        let mut names: Vec<_> = self.workflows.keys().cloned().collect();
        names.sort();
        names
    }

    /// Registered activity type names, sorted.
    pub fn activity_types(&self) -> Vec<String> {
        let mut names: Vec<_> = self.activities.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("workflows", &self.workflow_types())
            .field("activities", &self.activity_types())
            .finish()
    }
}
