//! Bounded queue between the decoder (producer, T1) and the Batcher
//! (consumer, T2). Carries two kinds of item, distinguished by a tag, so a
//! checkpoint can be interleaved with the row mutations it brackets without
//! a second channel.

use tokio::sync::mpsc;

use crate::msg::{Cursor, Msg};

/// One slot on the channel: either a row mutation to buffer, or a cursor
/// marking "everything the producer has handed off up to this point".
#[derive(Debug, Clone)]
pub enum ChannelItem {
    Message(Msg),
    Cursor(Cursor),
}

pub type Sender = mpsc::Sender<ChannelItem>;
pub type Receiver = mpsc::Receiver<ChannelItem>;

/// Builds the bounded channel sized by `channel-size`. The config layer
/// (`SyncParamConfig::normalize`) already clamps this to a sane floor, so
/// the only job here is to turn it into `mpsc::channel`'s capacity.
pub fn bounded(channel_size: usize) -> (Sender, Receiver) {
    mpsc::channel(channel_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::TableRef;
    use serde_json::json;

    #[tokio::test]
    async fn items_are_received_in_fifo_order() {
        let (tx, mut rx) = bounded(100);
        let cursor = Cursor::Binlog {
            gtid_set: "x".into(),
            epoch: 1,
        };
        let msg = Msg::insert(
            TableRef::new("s", "t"),
            [("id".to_string(), json!(1))].into_iter().collect(),
            cursor.clone(),
        );
        tx.send(ChannelItem::Message(msg)).await.unwrap();
        tx.send(ChannelItem::Cursor(cursor)).await.unwrap();
        drop(tx);

        assert!(matches!(rx.recv().await, Some(ChannelItem::Message(_))));
        assert!(matches!(rx.recv().await, Some(ChannelItem::Cursor(_))));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn send_blocks_once_capacity_is_reached() {
        let (tx, mut rx) = bounded(1);
        let cursor = Cursor::Binlog {
            gtid_set: "x".into(),
            epoch: 1,
        };
        tx.send(ChannelItem::Cursor(cursor.clone())).await.unwrap();

        let tx2 = tx.clone();
        let blocked = tokio::spawn(async move {
            tx2.send(ChannelItem::Cursor(cursor)).await.unwrap();
        });

        tokio::task::yield_now().await;
        assert!(!blocked.is_finished());

        rx.recv().await.unwrap();
        blocked.await.unwrap();
    }
}
