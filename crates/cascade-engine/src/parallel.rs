use std::future::Future;

/// Run independent operations concurrently; results come back in request order.
pub async fn join_ordered<I, F, T>(operations: I) -> Vec<T>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = T>,
{
    futures::future::join_all(operations).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_results_in_request_order() {
        let ops = [30u64, 5, 15].map(|ms| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            ms
        });
        assert_eq!(join_ordered(ops).await, vec![30, 5, 15]);
    }

    #[tokio::test]
    async fn test_runs_concurrently() {
        let start = std::time::Instant::now();
        let ops = (0..4).map(|_| tokio::time::sleep(Duration::from_millis(50)));
        join_ordered(ops).await;
        assert!(start.elapsed() < Duration::from_millis(180));
    }

    #[tokio::test]
    async fn test_empty() {
        let ops: Vec<std::future::Ready<u8>> = vec![];
        assert!(join_ordered(ops).await.is_empty());
    }
}
