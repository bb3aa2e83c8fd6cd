//! Command wrappers and helpers.

use std::collections::HashMap;

const XHEADER_PREFIX: &str = "sip_h_X-";

/// Builds a `originate` command string of the form dictated by
/// mod_commands:
///
/// ```text
/// originate {var=val,...}<endpoint>/<profile>/<dest>[;fs_path=sip:<proxy>] \
///     &<app>(<args>) | <exten> <dialplan> <context>
/// ```
///
/// Leaving [`OriginateBuilder::uuid_str`] unset emits a `{uuid_str}`
/// placeholder so the rendered string can be cached as a reusable template
/// (see [`OriginateTemplate`]).
#[derive(Debug, Clone)]
pub struct OriginateBuilder {
    dest_url: String,
    uuid_str: Option<String>,
    profile: String,
    gateway: Option<String>,
    app_name: String,
    app_arg: String,
    dp_exten: Option<String>,
    dp_type: String,
    dp_context: String,
    proxy: Option<String>,
    endpoint: String,
    timeout: u32,
    caller_id: String,
    caller_id_num: String,
    codec: String,
    abs_codec: String,
    xheaders: Vec<(String, String)>,
    extra_vars: Vec<(String, String)>,
}

impl OriginateBuilder {
    /// Start from a destination url of the form `<user>@<domain>:<port>`.
    pub fn new(dest_url: impl Into<String>) -> OriginateBuilder {
        OriginateBuilder {
            dest_url: dest_url.into(),
            uuid_str: None,
            profile: "external".to_string(),
            gateway: None,
            app_name: "park".to_string(),
            app_arg: String::new(),
            dp_exten: None,
            dp_type: "xml".to_string(),
            dp_context: "default".to_string(),
            proxy: None,
            endpoint: "sofia".to_string(),
            timeout: 60,
            caller_id: "Mr_Switchgen".to_string(),
            caller_id_num: "1112223333".to_string(),
            codec: "PCMU".to_string(),
            abs_codec: String::new(),
            xheaders: Vec::new(),
            extra_vars: Vec::new(),
        }
    }

    pub fn uuid_str(mut self, uuid: impl Into<String>) -> Self {
        self.uuid_str = Some(uuid.into());
        self
    }

    /// Sofia profile (UA) name used for the outbound call.
    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = profile.into();
        self
    }

    pub fn gateway(mut self, gateway: impl Into<String>) -> Self {
        self.gateway = Some(gateway.into());
        self
    }

    /// Application (with args) executed on the originating leg once the
    /// call is answered.
    pub fn app(mut self, name: impl Into<String>, arg: impl Into<String>) -> Self {
        self.app_name = name.into();
        self.app_arg = arg.into();
        self
    }

    /// Process the originating leg through a dialplan extension instead of
    /// an explicit app.
    pub fn dp_exten(mut self, exten: impl Into<String>) -> Self {
        self.dp_exten = Some(exten.into());
        self
    }

    pub fn dp_context(mut self, context: impl Into<String>) -> Self {
        self.dp_context = context.into();
        self
    }

    /// First-hop uri appended as `;fs_path=sip:<proxy>`.
    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn timeout(mut self, secs: u32) -> Self {
        self.timeout = secs;
        self
    }

    pub fn caller_id(mut self, name: impl Into<String>, number: impl Into<String>) -> Self {
        self.caller_id = name.into();
        self.caller_id_num = number.into();
        self
    }

    pub fn codec(mut self, codec: impl Into<String>) -> Self {
        self.codec = codec.into();
        self
    }

    pub fn absolute_codec(mut self, codec: impl Into<String>) -> Self {
        self.abs_codec = codec.into();
        self
    }

    /// Add a SIP x-header variable; the `sip_h_X-` prefix is applied when
    /// missing.
    pub fn xheader(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.xheaders.push((name.into(), value.into()));
        self
    }

    /// Set (or override) an arbitrary originate channel variable.
    pub fn var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_vars.push((name.into(), value.into()));
        self
    }

    /// Render the final command string.
    pub fn build(&self) -> String {
        let mut params: Vec<(String, String)> = vec![
            ("originate_timeout".into(), self.timeout.to_string()),
            ("origination_caller_id_name".into(), self.caller_id.clone()),
            (
                "origination_caller_id_number".into(),
                self.caller_id_num.clone(),
            ),
            ("originator_codec".into(), self.codec.clone()),
            ("absolute_codec_string".into(), self.abs_codec.clone()),
            (
                "origination_uuid".into(),
                self.uuid_str.clone().unwrap_or_else(|| "{uuid_str}".into()),
            ),
            ("ignore_display_updates".into(), "true".into()),
            ("ignore_early_media".into(), "true".into()),
        ];

        for (name, value) in &self.xheaders {
            let name = if name.contains(XHEADER_PREFIX) {
                name.clone()
            } else {
                format!("{XHEADER_PREFIX}{name}")
            };
            set_param(&mut params, name, value.clone());
        }
        for (name, value) in &self.extra_vars {
            set_param(&mut params, name.clone(), value.clone());
        }

        let pairs: Vec<String> = params
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();

        let app_part = match &self.dp_exten {
            Some(exten) => format!("{exten} {} {}", self.dp_type, self.dp_context),
            None => format!("&{}({})", self.app_name, self.app_arg),
        };

        let profile = match &self.gateway {
            Some(gateway) => format!("gateway/{gateway}"),
            None => self.profile.clone(),
        };
        let dest = match &self.proxy {
            Some(proxy) => format!(";fs_path=sip:{proxy}"),
            None => String::new(),
        };

        format!(
            "originate {{{vars}}}{endpoint}/{profile}/{dest_url}{dest} {app_part}",
            vars = pairs.join(","),
            endpoint = self.endpoint,
            profile = profile,
            dest_url = self.dest_url,
            dest = dest,
            app_part = app_part,
        )
    }
}

fn set_param(params: &mut Vec<(String, String)>, name: String, value: String) {
    match params.iter_mut().find(|(existing, _)| *existing == name) {
        Some(slot) => slot.1 = value,
        None => params.push((name, value)),
    }
}

/// A cached originate command with late-bound fields.
///
/// `{uuid_str}` and `{app_id}` are filled per call; any further
/// `{placeholder}` tokens are satisfied from the caller's replacement map.
#[derive(Debug, Clone)]
pub struct OriginateTemplate {
    cmd: String,
}

impl OriginateTemplate {
    pub fn new(cmd: impl Into<String>) -> OriginateTemplate {
        OriginateTemplate { cmd: cmd.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.cmd
    }

    pub fn render(
        &self,
        uuid_str: &str,
        app_id: &str,
        rep_fields: &HashMap<String, String>,
    ) -> String {
        let mut cmd = self
            .cmd
            .replace("{uuid_str}", uuid_str)
            .replace("{app_id}", app_id);
        for (field, value) in rep_fields {
            cmd = cmd.replace(&format!("{{{field}}}"), value);
        }
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_with_explicit_uuid() {
        let cmd = OriginateBuilder::new("toneplay@10.10.8.21:5080")
            .uuid_str("abc-123")
            .app("playback", "tone_stream://%(251,0,1004)")
            .build();

        assert!(cmd.starts_with("originate {"));
        assert!(cmd.contains("origination_uuid=abc-123"));
        assert!(cmd.contains("originate_timeout=60"));
        assert!(cmd.contains("ignore_early_media=true"));
        assert!(cmd.contains("ignore_display_updates=true"));
        assert!(cmd.ends_with(
            "sofia/external/toneplay@10.10.8.21:5080 &playback(tone_stream://%(251,0,1004))"
        ));
    }

    #[test]
    fn xheaders_gain_the_sip_prefix_once() {
        let cmd = OriginateBuilder::new("doggy@fs.lab")
            .uuid_str("u")
            .xheader("switchgen_originating_session", "u")
            .xheader("sip_h_X-already", "yes")
            .build();
        assert!(cmd.contains("sip_h_X-switchgen_originating_session=u"));
        assert!(cmd.contains("sip_h_X-already=yes"));
        assert!(!cmd.contains("sip_h_X-sip_h_X-"));
    }

    #[test]
    fn gateway_and_proxy_compose_the_call_url() {
        let cmd = OriginateBuilder::new("dest@far.end")
            .uuid_str("u")
            .gateway("upstream")
            .proxy("1.2.3.4:5060")
            .build();
        assert!(cmd.contains("sofia/gateway/upstream/dest@far.end;fs_path=sip:1.2.3.4:5060"));
    }

    #[test]
    fn dialplan_tail_replaces_the_app() {
        let cmd = OriginateBuilder::new("dest@far.end")
            .uuid_str("u")
            .dp_exten("9196")
            .dp_context("public")
            .build();
        assert!(cmd.ends_with("sofia/external/dest@far.end 9196 xml public"));
    }

    #[test]
    fn template_renders_late_fields() {
        let cmd = OriginateBuilder::new("{dest}@{host}")
            .var("sip_h_X-app", "{app_id}")
            .build();
        let template = OriginateTemplate::new(cmd);

        let mut rep = HashMap::new();
        rep.insert("dest".to_string(), "echo".to_string());
        rep.insert("host".to_string(), "10.0.0.1".to_string());
        let rendered = template.render("uuid-1", "loadtest", &rep);

        assert!(rendered.contains("origination_uuid=uuid-1"));
        assert!(rendered.contains("sip_h_X-app=loadtest"));
        assert!(rendered.contains("sofia/external/echo@10.0.0.1"));
        assert!(!rendered.contains("{uuid_str}"));
        assert!(!rendered.contains("{app_id}"));
        assert!(!rendered.contains("{dest}"));
    }

    #[test]
    fn extra_vars_override_defaults() {
        let cmd = OriginateBuilder::new("d@h")
            .uuid_str("u")
            .var("originator_codec", "OPUS")
            .build();
        assert!(cmd.contains("originator_codec=OPUS"));
        assert!(!cmd.contains("originator_codec=PCMU"));
    }
}
