//! The controllers and webhooks which can be disabled on the command line.
use extension_framework::{
    cli::{AddToManagerFn, SwitchOptions, controller_switch},
    webhook::{WebhookFactory, webhook_switch},
};

use crate::{
    controller::{controlplane, healthcheck, infrastructure, worker},
    registry::Registry,
    webhook::controlplaneexposure,
};

/// All controllers of the extension, in the order they are added to the manager.
pub fn controller_switch_options() -> SwitchOptions<AddToManagerFn<Registry>> {
    SwitchOptions::controllers(vec![
        controller_switch(controlplane::NAME, controlplane::add_to_manager),
        controller_switch(infrastructure::NAME, infrastructure::add_to_manager),
        controller_switch(worker::NAME, worker::add_to_manager),
        controller_switch(healthcheck::NAME, healthcheck::add_to_manager),
    ])
}

/// All webhooks of the extension.
pub fn webhook_switch_options() -> SwitchOptions<WebhookFactory<Registry>> {
    SwitchOptions::webhooks(vec![webhook_switch(
        controlplaneexposure::NAME,
        controlplaneexposure::add_to_manager,
    )])
}

#[cfg(test)]
mod tests {
    use extension_framework::cli::{Flags, OptionSet};

    use super::*;

    #[test]
    fn every_component_can_be_disabled_by_name() {
        let controllers = controller_switch_options();
        let webhooks = webhook_switch_options();

        let mut flags = Flags::new("test");
        controllers.add_flags(&mut flags);
        webhooks.add_flags(&mut flags);
        let parsed = flags
            .try_parse_from([
                "test",
                "--disable-controllers=infrastructure,healthcheck",
                "--disable-webhooks=controlplaneexposure",
            ])
            .expect("flags must parse");

        let controllers = controllers.complete(&parsed.view()).expect("controllers must complete");
        let webhooks = webhooks.complete(&parsed.view()).expect("webhooks must complete");

        assert_eq!(controllers.names().collect::<Vec<_>>(), ["controlplane", "worker"]);
        assert_eq!(webhooks.names().count(), 0);
    }
}
