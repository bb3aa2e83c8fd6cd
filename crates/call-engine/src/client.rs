//! Operator-facing per-node client facade.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use switchgen_esl_core::Event;
use switchgen_esl_transport::Connection;
use switchgen_session_core::models::JobCallback;
use switchgen_session_core::{EventListener, Job};

use crate::app::{AppContext, CallApp, CallCounts, LoadedApp};
use crate::commands::{OriginateBuilder, OriginateTemplate};
use crate::error::{Error, Result};
use crate::pool::SlavePool;

/// Default channel variable carrying the app id, forwarded as a SIP
/// x-header by intermediaries.
pub const APP_ID_VAR: &str = "sip_h_X-switchgen_app";

/// Parameters for one `originate` invocation.
#[derive(Default)]
pub struct OriginateSpec {
    /// Destination url; `None` renders the cached originate template.
    pub dest_url: Option<String>,
    pub app_id: Option<String>,
    /// Session uuid override; generated when unset.
    pub uuid_str: Option<String>,
    /// Replacement fields applied to the cached template.
    pub rep_fields: HashMap<String, String>,
    /// Callback attached to the resulting job.
    pub callback: Option<JobCallback>,
}

struct ClientInner {
    con: Connection,
    listener: EventListener,
    id: String,
    apps: Mutex<HashMap<String, Vec<LoadedApp>>>,
    orig_cmd: Mutex<Option<OriginateTemplate>>,
}

/// High level per-node api for registering apps, originating calls and
/// proxying commands; shares the listener's transmit connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(listener: EventListener) -> Client {
        let con = listener.event_loop().con().clone();
        Client {
            inner: Arc::new(ClientInner {
                con,
                listener,
                id: Uuid::new_v4().to_string(),
                apps: Mutex::new(HashMap::new()),
                orig_cmd: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn host(&self) -> &str {
        self.inner.con.host()
    }

    pub fn con(&self) -> &Connection {
        &self.inner.con
    }

    pub fn listener(&self) -> &EventListener {
        &self.inner.listener
    }

    /// Originate channel variable matching the listener's call tracking
    /// header (the `variable_` event prefix stripped).
    pub fn call_tracking_var(&self) -> String {
        strip_event_prefix(self.inner.listener.call_tracking_header())
    }

    /// Event header under which the app id variable comes back.
    pub fn app_id_header(&self) -> String {
        format!("variable_{APP_ID_VAR}")
    }

    pub async fn connect(&self) -> Result<()> {
        self.inner.con.connect().await?;
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.inner.con.disconnect().await?;
        Ok(())
    }

    pub fn connected(&self) -> bool {
        self.inner.con.connected()
    }

    /// Invoke an api command with error checking.
    pub async fn api(&self, cmd: &str) -> Result<Event> {
        Ok(self.inner.con.api(cmd).await?)
    }

    /// Return the string body output from invoking an api command.
    pub async fn cmd(&self, cmd: &str) -> Result<String> {
        Ok(self.inner.con.cmd(cmd).await?)
    }

    /// Execute a non-blocking api call, tracked to completion as a [`Job`].
    ///
    /// The send/register pair runs under the listener's job gate so the
    /// `BACKGROUND_JOB` handler cannot race the insertion.
    pub async fn bgapi(
        &self,
        cmd: &str,
        sess_uuid: Option<String>,
        client_id: Option<String>,
        callback: Option<JobCallback>,
    ) -> Result<Arc<Job>> {
        if !self.inner.listener.is_running() {
            return Err(Error::Config(
                "start this node's event loop before issuing bgapi".to_string(),
            ));
        }
        let _gate = self.inner.listener.block_jobs().await;
        let reply = self.inner.con.bgapi(cmd).await?;
        let job = self
            .inner
            .listener
            .register_job(&reply, sess_uuid, client_id, callback)?;
        Ok(job)
    }

    /// Originate a call; non-blocking, returns the background job.
    pub async fn originate(&self, spec: OriginateSpec) -> Result<Arc<Job>> {
        let uuid_str = spec
            .uuid_str
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let app_id = spec
            .app_id
            .clone()
            .unwrap_or_else(|| self.inner.id.clone());

        let cmd = match &spec.dest_url {
            Some(dest_url) => OriginateBuilder::new(dest_url.clone())
                .uuid_str(uuid_str.clone())
                .var(APP_ID_VAR, app_id.clone())
                .var(self.call_tracking_var(), uuid_str.clone())
                .build(),
            None => {
                let template = self.inner.orig_cmd.lock().clone();
                let Some(template) = template else {
                    return Err(Error::Config(
                        "no originate command template has been set".to_string(),
                    ));
                };
                template.render(&uuid_str, &app_id, &spec.rep_fields)
            }
        };

        self.bgapi(&cmd, Some(uuid_str), Some(app_id), spec.callback)
            .await
    }

    /// Build and cache an originate command for later [`Client::originate`]
    /// calls, leaving `{uuid_str}`/`{app_id}` late-bound.
    pub fn set_orig_cmd(&self, builder: OriginateBuilder) {
        let cmd = builder
            .var(APP_ID_VAR, "{app_id}")
            .var(self.call_tracking_var(), "{uuid_str}")
            .build();
        debug!("caching originate cmd: {cmd}");
        *self.inner.orig_cmd.lock() = Some(OriginateTemplate::new(cmd));
    }

    pub fn originate_cmd(&self) -> Option<String> {
        self.inner
            .orig_cmd
            .lock()
            .as_ref()
            .map(|t| t.as_str().to_string())
    }

    /// Hangup calls for one app id, or for every app this client loaded.
    pub async fn hupall(&self, app_id: Option<&str>) -> Result<()> {
        let ids: Vec<String> = match app_id {
            Some(id) => vec![id.to_string()],
            None => self.inner.apps.lock().keys().cloned().collect(),
        };
        for id in ids {
            self.api(&format!("hupall NORMAL_CLEARING {APP_ID_VAR} {id}"))
                .await?;
        }
        Ok(())
    }

    /// Load a call app under an app id, registering its records on the
    /// node's event loop.
    pub async fn load_app(
        &self,
        app: Arc<dyn CallApp>,
        app_id: Option<&str>,
        pool: Option<&SlavePool>,
        prepend: bool,
    ) -> Result<String> {
        let name = app.name().to_string();
        let group_id = app_id.unwrap_or(&name).to_string();

        {
            let apps = self.inner.apps.lock();
            if group_id != "default"
                && apps
                    .get(&group_id)
                    .is_some_and(|loaded| loaded.iter().any(|l| l.name == name))
            {
                return Err(Error::Config(format!(
                    "an app instance named '{name}' already exists for app group '{group_id}'"
                )));
            }
        }

        let mut reg = crate::app::Registrar::new();
        app.clone().register(&mut reg);
        if reg.is_empty() {
            return Err(Error::Config(format!(
                "failed to load '{name}': no callbacks or handlers could be found"
            )));
        }

        let counts: Arc<dyn CallCounts> = match pool {
            Some(pool) => Arc::new(pool.clone()),
            None => Arc::new(self.inner.listener.clone()),
        };
        app.setup(&AppContext {
            listener: self.inner.listener.clone(),
            counts,
        })?;

        info!("loading '{name}' app with group id '{group_id}' on '{}'", self.host());
        let event_loop = self.inner.listener.event_loop().clone();
        for (evname, handler) in reg.handlers {
            event_loop.add_handler(&evname, handler).await?;
        }
        let mut callbacks = Vec::new();
        for (evname, callback) in reg.callbacks {
            if !event_loop.has_handler(&evname) {
                info!("adding default session lookup handler for event type '{evname}'");
                event_loop
                    .add_handler(&evname, self.inner.listener.lookup_handler())
                    .await?;
            }
            event_loop.add_callback(&evname, &group_id, callback.clone(), prepend);
            callbacks.push((evname, callback));
        }
        let mut coroutines = Vec::new();
        for (evname, coroutine) in reg.coroutines {
            if !event_loop.has_handler(&evname) {
                event_loop
                    .add_handler(&evname, self.inner.listener.lookup_handler())
                    .await?;
            }
            event_loop.add_coroutine(&evname, &group_id, coroutine.clone(), prepend);
            coroutines.push((evname, coroutine));
        }

        // the app id header wins over older registrations
        event_loop.prepend_app_id_header(&self.app_id_header());

        self.inner
            .apps
            .lock()
            .entry(group_id.clone())
            .or_default()
            .push(LoadedApp {
                app,
                name,
                callbacks,
                coroutines,
            });
        Ok(group_id)
    }

    /// Unload all apps for an app id (or just the named one), removing
    /// their registrations and running teardown.
    pub fn unload_app(&self, app_id: &str, name: Option<&str>) {
        let mut apps = self.inner.apps.lock();
        let Some(loaded) = apps.get_mut(app_id) else {
            debug!("app group '{app_id}' was already unloaded");
            return;
        };
        let event_loop = self.inner.listener.event_loop();
        let keep = |l: &LoadedApp| name.is_some_and(|n| l.name != n);
        for l in loaded.iter().filter(|l| !keep(l)) {
            for (evname, callback) in &l.callbacks {
                event_loop.remove_callback(evname, app_id, callback);
            }
            for (evname, coroutine) in &l.coroutines {
                event_loop.remove_coroutine(evname, app_id, coroutine);
            }
            l.app.teardown();
        }
        loaded.retain(keep);
        if loaded.is_empty() {
            apps.remove(app_id);
        }
    }

    /// Loaded app ids.
    pub fn app_ids(&self) -> Vec<String> {
        self.inner.apps.lock().keys().cloned().collect()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("host", &self.host())
            .field("id", &self.inner.id)
            .finish()
    }
}

fn strip_event_prefix(header: &str) -> String {
    header
        .strip_prefix("variable_")
        .unwrap_or(header)
        .to_string()
}
