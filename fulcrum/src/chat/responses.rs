//! Canned assistant replies.

use rand::seq::IndexedRandom;

/// Replies the simulated assistant picks from.
pub const CANNED_RESPONSES: [&str; 5] = [
    "I'm here to help! Based on your query, I can provide insights and analysis from your data. What specific information would you like to explore?",
    "That's a great question! Let me analyze the data and provide you with a comprehensive answer. The insights show some interesting patterns.",
    "I understand what you're looking for. Based on the available data, here are the key findings that might help address your question.",
    "Thank you for your question! I've processed the information and here's what I found. Would you like me to dive deeper into any specific aspect?",
    "Excellent query! The data reveals several important trends. Let me break down the most relevant insights for you.",
];

/// Uniformly random reply from [`CANNED_RESPONSES`].
#[must_use]
pub fn pick_response() -> &'static str {
    CANNED_RESPONSES
        .choose(&mut rand::rng())
        .copied()
        .unwrap_or(CANNED_RESPONSES[0])
}
