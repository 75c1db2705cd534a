use crate::types::ChannelId;

pub const TOPIC_RELAY1_CONTROL: &str = "home/relay1/control";
pub const TOPIC_RELAY2_CONTROL: &str = "home/relay2/control";

pub const TOPIC_STATUS: &str = "home/relay/status";
pub const TOPIC_COMMAND: &str = "home/relay/command";

pub const MAX_MQTT_PAYLOAD_BYTES: usize = 512;

pub const SUBSCRIBED_TOPICS: [&str; 3] = [TOPIC_RELAY1_CONTROL, TOPIC_RELAY2_CONTROL, TOPIC_COMMAND];

pub fn control_topic(channel: ChannelId) -> &'static str {
    match channel.index() {
        0 => TOPIC_RELAY1_CONTROL,
        _ => TOPIC_RELAY2_CONTROL,
    }
}

pub fn control_topic_channel(topic: &str) -> Option<ChannelId> {
    ChannelId::ALL
        .into_iter()
        .find(|channel| control_topic(*channel) == topic)
}
