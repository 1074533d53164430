use contracts::{LifecycleEvent, MessageTemplate, Operation, RenderedMessage};

pub const SYSTEM_SENDER: &str = "SYSTEM";

/// Renders the inbox message for `event`. Pure; missing authored content
/// falls back to the system handler's generic wording.
pub fn describe(operation: &Operation, event: LifecycleEvent) -> RenderedMessage {
    let bindings = &operation.narrative;
    let authored = match event {
        LifecycleEvent::Activated => bindings.activation.as_ref(),
        LifecycleEvent::Completed => bindings.completion.as_ref(),
        LifecycleEvent::Failed => bindings.failure.as_ref(),
    };

    match authored {
        Some(template) => RenderedMessage {
            sender: handler(operation).to_string(),
            subject: render(&template.subject, operation),
            body: render(&template.body, operation),
        },
        None => {
            let template = fallback(event);
            RenderedMessage {
                sender: SYSTEM_SENDER.to_string(),
                subject: render(&template.subject, operation),
                body: render(&template.body, operation),
            }
        }
    }
}

fn handler(operation: &Operation) -> &str {
    operation
        .narrative
        .handler
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(SYSTEM_SENDER)
}

fn fallback(event: LifecycleEvent) -> MessageTemplate {
    let (subject, body) = match event {
        LifecycleEvent::Activated => (
            "New operation: {title}",
            "Operation {operation_id} is now available. Check your active operations.",
        ),
        LifecycleEvent::Completed => (
            "Operation complete: {title}",
            "Operation {operation_id} is complete. {credits} credits have been transferred.",
        ),
        LifecycleEvent::Failed => (
            "Operation stalled: {title}",
            "The payout for operation {operation_id} could not be processed.",
        ),
    };
    MessageTemplate {
        subject: subject.to_string(),
        body: body.to_string(),
    }
}

fn render(template: &str, operation: &Operation) -> String {
    let title = if operation.title.trim().is_empty() {
        operation.id.as_str()
    } else {
        operation.title.as_str()
    };
    template
        .replace("{operation_id}", &operation.id)
        .replace("{title}", title)
        .replace("{handler}", handler(operation))
        .replace("{credits}", &operation.rewards.credits.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{NarrativeBindings, OperationTrigger, Rewards};

    fn operation(narrative: NarrativeBindings) -> Operation {
        Operation {
            id: "SR-201".to_string(),
            version: 1,
            title: "Signal Relay".to_string(),
            status: Default::default(),
            trigger: OperationTrigger::OnFirstSessionOpen,
            requirements: Default::default(),
            steps: Vec::new(),
            rewards: Rewards {
                credits: 200,
                flags: Default::default(),
                completion_flag: "quest_SR201_completed".to_string(),
            },
            default_host_id: None,
            filesystem_overlays: Default::default(),
            narrative,
        }
    }

    #[test]
    fn authored_template_fills_placeholders() {
        let op = operation(NarrativeBindings {
            handler: Some("Vex".to_string()),
            activation: None,
            completion: Some(MessageTemplate {
                subject: "{title} done".to_string(),
                body: "{handler} wired {credits} for {operation_id}.".to_string(),
            }),
            failure: None,
        });
        let message = describe(&op, LifecycleEvent::Completed);
        assert_eq!(message.sender, "Vex");
        assert_eq!(message.subject, "Signal Relay done");
        assert_eq!(message.body, "Vex wired 200 for SR-201.");
    }

    #[test]
    fn missing_variant_falls_back_to_system() {
        let op = operation(NarrativeBindings {
            handler: Some("Vex".to_string()),
            ..Default::default()
        });
        let message = describe(&op, LifecycleEvent::Failed);
        assert_eq!(message.sender, SYSTEM_SENDER);
        assert!(message.body.contains("SR-201"));
        assert_eq!(message, describe(&op, LifecycleEvent::Failed));
    }
}
