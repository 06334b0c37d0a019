//! The stage contract every pipeline step implements.
//!
//! A stage turns one input into zero or more outputs and is flushed exactly
//! once when the source is exhausted, fails, or the run is cancelled. Stages
//! compose with [`StageExt::then`]; the composite flushes each inner stage
//! once, feeding the first stage's flush output through the second.

use async_trait::async_trait;

#[async_trait]
pub trait Stage: Send {
    type In: Send + 'static;
    type Out: Send + 'static;

    /// Transforms one item. May return nothing (a drop) or several items.
    async fn process(&mut self, item: Self::In) -> Vec<Self::Out>;

    /// Called once after the last `process` call.
    async fn flush(&mut self) -> Vec<Self::Out>;
}

/// Two stages run back to back.
pub struct Chain<A, B> {
    first: A,
    second: B,
}

#[async_trait]
impl<A, B> Stage for Chain<A, B>
where
    A: Stage,
    B: Stage<In = A::Out>,
{
    type In = A::In;
    type Out = B::Out;

    async fn process(&mut self, item: Self::In) -> Vec<Self::Out> {
        let mut out = Vec::new();
        for mid in self.first.process(item).await {
            out.extend(self.second.process(mid).await);
        }
        out
    }

    async fn flush(&mut self) -> Vec<Self::Out> {
        let mut out = Vec::new();
        for mid in self.first.flush().await {
            out.extend(self.second.process(mid).await);
        }
        out.extend(self.second.flush().await);
        out
    }
}

pub trait StageExt: Stage + Sized {
    /// Feeds this stage's output into `next`.
    fn then<B>(self, next: B) -> Chain<Self, B>
    where
        B: Stage<In = Self::Out>,
    {
        Chain {
            first: self,
            second: next,
        }
    }
}

impl<S: Stage> StageExt for S {}

/// An absent optional stage passes items through unchanged.
#[async_trait]
impl<S, T> Stage for Option<S>
where
    S: Stage<In = T, Out = T>,
    T: Send + 'static,
{
    type In = T;
    type Out = T;

    async fn process(&mut self, item: T) -> Vec<T> {
        match self {
            Some(stage) => stage.process(item).await,
            None => vec![item],
        }
    }

    async fn flush(&mut self) -> Vec<T> {
        match self {
            Some(stage) => stage.flush().await,
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Doubler {
        flushed: usize,
    }

    #[async_trait]
    impl Stage for Doubler {
        type In = u32;
        type Out = u32;

        async fn process(&mut self, item: u32) -> Vec<u32> {
            vec![item, item]
        }

        async fn flush(&mut self) -> Vec<u32> {
            self.flushed += 1;
            vec![0]
        }
    }

    struct Stringify;

    #[async_trait]
    impl Stage for Stringify {
        type In = u32;
        type Out = String;

        async fn process(&mut self, item: u32) -> Vec<String> {
            if item == 3 { Vec::new() } else { vec![item.to_string()] }
        }

        async fn flush(&mut self) -> Vec<String> {
            vec!["end".to_string()]
        }
    }

    #[tokio::test]
    async fn test_chain_expands_and_drops() {
        let mut chain = Doubler { flushed: 0 }.then(Stringify);
        assert_eq!(chain.process(1).await, vec!["1", "1"]);
        assert!(chain.process(3).await.is_empty());
        assert_eq!(chain.flush().await, vec!["0", "end"]);
        assert_eq!(chain.first.flushed, 1);
    }

    #[tokio::test]
    async fn test_absent_optional_stage_is_identity() {
        let mut stage: Option<Doubler> = None;
        assert_eq!(stage.process(7).await, vec![7]);
        assert!(stage.flush().await.is_empty());

        let mut stage = Some(Doubler { flushed: 0 });
        assert_eq!(stage.process(7).await, vec![7, 7]);
    }
}
