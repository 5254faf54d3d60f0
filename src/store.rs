/*!
 * Parameter store abstraction
 *
 * Callers read structure trees and series and drive model runs through
 * `ParameterStore`. `RemoteStore` serves those requests from a remote
 * instance; a local database accessor implements the same trait so callers
 * do not care which one they hold.
 */

use skyrun_core_wire::{SeriesBatch, StructureEntry};

use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::lifecycle::{Instance, LifecycleManager};
use crate::remote::Connector;

/// Structure, value, and model operations shared by local and remote stores
pub trait ParameterStore {
    fn export_structure(&mut self, table: &str) -> Result<Vec<StructureEntry>>;

    /// One series per requested ID, in request order
    fn export_values(&mut self, table: &str, ids: &[u32]) -> Result<SeriesBatch>;

    fn create_parameter_store(&mut self, exe_name: &str, input_file: &str) -> Result<()>;

    fn export_parameters(&mut self, exe_name: &str) -> Result<()>;

    fn run_model(&mut self, exe_name: &str, input_file: &str, db_name: &str) -> Result<()>;
}

/// `ParameterStore` backed by a remote instance
///
/// Every request checks the instance session is still alive before using
/// it. Failures are reported on the manager's event stream as well as
/// returned.
pub struct RemoteStore<C: Connector> {
    manager: LifecycleManager<C>,
    dispatcher: Dispatcher,
}

impl<C: Connector> RemoteStore<C> {
    pub fn new(manager: LifecycleManager<C>) -> Self {
        let dispatcher = Dispatcher::new(manager.config().helper.clone());
        Self {
            manager,
            dispatcher,
        }
    }

    /// Log into `user`'s instance, creating it if needed
    pub fn ensure(&mut self, user: &str) -> Result<Instance> {
        self.manager.ensure_instance(user)
    }

    pub fn manager(&self) -> &LifecycleManager<C> {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut LifecycleManager<C> {
        &mut self.manager
    }

    pub fn into_manager(self) -> LifecycleManager<C> {
        self.manager
    }

    fn report<T>(&self, what: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.manager.events().log_error(format!("{} failed: {}", what, e));
        }
        result
    }
}

impl<C: Connector> ParameterStore for RemoteStore<C> {
    fn export_structure(&mut self, table: &str) -> Result<Vec<StructureEntry>> {
        let dispatcher = &self.dispatcher;
        let result = self
            .manager
            .with_instance_session(|s| dispatcher.export_structure(s, table));
        self.report("Structure export", result)
    }

    fn export_values(&mut self, table: &str, ids: &[u32]) -> Result<SeriesBatch> {
        let dispatcher = &self.dispatcher;
        let result = self
            .manager
            .with_instance_session(|s| dispatcher.export_values(s, table, ids));
        self.report("Value export", result)
    }

    fn create_parameter_store(&mut self, exe_name: &str, input_file: &str) -> Result<()> {
        let dispatcher = &self.dispatcher;
        let result = self
            .manager
            .with_instance_session(|s| dispatcher.create_parameter_store(s, exe_name, input_file));
        self.report("Parameter database creation", result)
    }

    fn export_parameters(&mut self, exe_name: &str) -> Result<()> {
        let dispatcher = &self.dispatcher;
        let result = self
            .manager
            .with_instance_session(|s| dispatcher.export_parameters(s, exe_name));
        self.report("Parameter export", result)
    }

    fn run_model(&mut self, exe_name: &str, input_file: &str, db_name: &str) -> Result<()> {
        let dispatcher = &self.dispatcher;
        let result = self
            .manager
            .with_instance_session(|s| dispatcher.run_model(s, exe_name, input_file, db_name));
        self.report("Model run", result)
    }
}
