use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use ethers::types::Address;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::blockchain::ChainClient;
use crate::types::ChainResult;

/// 계정별 nonce 상태
///
/// `in_flight`의 모든 값은 서로 다르고 `confirmed` 이상이다.
/// `released`는 브로드캐스트 전에 반납된 값으로, `next`보다 작고 다음 할당 때 가장 작은 것부터 재사용된다.
/// `settled`는 confirm 되었지만 더 작은 nonce가 아직 남아 있어 `confirmed`가 넘어가지 못한 값들이다.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NonceState {
    pub confirmed: u64,
    pub next: u64,
    pub in_flight: BTreeSet<u64>,
    pub released: BTreeSet<u64>,
    pub settled: BTreeSet<u64>,
}

impl NonceState {
    pub fn new(chain_nonce: u64) -> Self {
        Self {
            confirmed: chain_nonce,
            next: chain_nonce,
            ..Default::default()
        }
    }

    fn allocate(&mut self) -> u64 {
        let nonce = match self.released.pop_first() {
            Some(reused) => reused,
            None => {
                let fresh = self.next;
                self.next += 1;
                fresh
            }
        };
        self.in_flight.insert(nonce);
        nonce
    }

    fn release(&mut self, nonce: u64) -> bool {
        if !self.in_flight.remove(&nonce) {
            return false;
        }

        if nonce + 1 == self.next {
            self.next = nonce;
            // 꼬리에 붙은 반납 값들도 함께 되감기
            while self.next > self.confirmed && self.released.remove(&(self.next - 1)) {
                self.next -= 1;
            }
        } else {
            self.released.insert(nonce);
        }
        true
    }

    fn confirm(&mut self, nonce: u64) {
        self.in_flight.remove(&nonce);
        self.released.remove(&nonce);
        if nonce >= self.confirmed {
            self.settled.insert(nonce);
        }
        self.advance_confirmed();
        if self.next < self.confirmed {
            self.next = self.confirmed;
        }
    }

    fn advance_confirmed(&mut self) {
        while self.settled.remove(&self.confirmed) {
            self.confirmed += 1;
        }
        let confirmed = self.confirmed;
        self.settled.retain(|n| *n >= confirmed);
    }

    /// 체인 값으로 재정렬. latest=채굴된 nonce, pending=멤풀 포함 nonce
    fn rebase(&mut self, latest: u64, pending: u64) {
        let pending = pending.max(latest);

        self.confirmed = latest;
        self.in_flight.retain(|n| *n >= latest);
        self.settled.retain(|n| *n >= latest && *n < pending);
        self.advance_confirmed();

        let after_in_flight = self.in_flight.iter().next_back().map(|n| n + 1).unwrap_or(0);
        let after_settled = self.settled.iter().next_back().map(|n| n + 1).unwrap_or(0);
        self.next = pending.max(after_in_flight).max(after_settled).max(self.confirmed);

        let next = self.next;
        let in_flight = &self.in_flight;
        // pending 아래의 반납 값은 이미 다른 트랜잭션이 사용
        self.released
            .retain(|n| *n >= pending && *n < next && !in_flight.contains(n));
    }

    pub fn check_invariants(&self) -> bool {
        self.in_flight.iter().all(|n| *n >= self.confirmed)
            && self.released.iter().all(|n| *n < self.next && !self.in_flight.contains(n))
            && self.next >= self.confirmed
    }
}

/// 계정별 nonce 할당기. 모든 변경은 하나의 락 아래에서 직렬화된다
pub struct NonceCore {
    chain: Arc<dyn ChainClient>,
    accounts: Mutex<HashMap<Address, NonceState>>,
}

impl NonceCore {
    pub fn new(chain: Arc<dyn ChainClient>) -> Self {
        Self {
            chain,
            accounts: Mutex::new(HashMap::new()),
        }
    }

    /// 체인에서 초기 nonce를 읽어 계정 상태를 준비
    pub async fn initialize(&self, account: Address) -> ChainResult<NonceState> {
        let mut accounts = self.accounts.lock().await;
        if let Some(state) = accounts.get(&account) {
            return Ok(state.clone());
        }
        let chain_nonce = self.chain.get_transaction_count(account, true).await?;
        let state = NonceState::new(chain_nonce);
        info!("🔢 Nonce 초기화: {:?} -> {}", account, chain_nonce);
        accounts.insert(account, state.clone());
        Ok(state)
    }

    pub async fn allocate(&self, account: Address) -> ChainResult<u64> {
        let mut accounts = self.accounts.lock().await;
        if !accounts.contains_key(&account) {
            let chain_nonce = self.chain.get_transaction_count(account, true).await?;
            info!("🔢 Nonce 초기화: {:?} -> {}", account, chain_nonce);
            accounts.insert(account, NonceState::new(chain_nonce));
        }

        let state = accounts.entry(account).or_default();
        let nonce = state.allocate();
        debug!("🔢 Nonce 할당: {} (next={}, in_flight={})", nonce, state.next, state.in_flight.len());
        Ok(nonce)
    }

    /// 브로드캐스트 전에 실패한 nonce 반납
    pub async fn release(&self, account: Address, nonce: u64) {
        let mut accounts = self.accounts.lock().await;
        let released_next = accounts
            .get_mut(&account)
            .and_then(|state| state.release(nonce).then_some(state.next));
        match released_next {
            Some(next) => {
                debug!("🔢 Nonce 반납: {} (next={})", nonce, next);
            }
            _ => warn!("⚠️ 할당되지 않은 nonce 반납 시도: {:?} / {}", account, nonce),
        }
    }

    /// 제출 성공 또는 브로드캐스트 이후 소모된 nonce 확정
    pub async fn confirm(&self, account: Address, nonce: u64) {
        let mut accounts = self.accounts.lock().await;
        if let Some(state) = accounts.get_mut(&account) {
            state.confirm(nonce);
            debug!("🔢 Nonce 확정: {} (confirmed={})", nonce, state.confirmed);
        }
    }

    /// 체인 nonce를 다시 읽어 로컬 상태를 재정렬
    pub async fn resync(&self, account: Address) -> ChainResult<NonceState> {
        // 조회 동안에도 락을 유지해 반납/할당과 섞이지 않게 한다
        let mut accounts = self.accounts.lock().await;
        let latest = self.chain.get_transaction_count(account, false).await?;
        let pending = self.chain.get_transaction_count(account, true).await?;

        let state = accounts
            .entry(account)
            .or_insert_with(|| NonceState::new(latest));
        let before = (state.confirmed, state.next);
        state.rebase(latest, pending);

        if before != (state.confirmed, state.next) {
            info!(
                "🔄 Nonce 재동기화: confirmed {} -> {}, next {} -> {}",
                before.0, state.confirmed, before.1, state.next
            );
        }
        Ok(state.clone())
    }

    /// 외부에서 관찰된 우리 계정의 트랜잭션. 로컬 상태와 어긋나면 재동기화
    pub async fn observe_external(&self, account: Address, nonce: u64) -> ChainResult<bool> {
        let diverged = {
            let accounts = self.accounts.lock().await;
            match accounts.get(&account) {
                Some(state) => {
                    nonce >= state.next
                        || state.released.contains(&nonce)
                        || (nonce >= state.confirmed
                            && !state.in_flight.contains(&nonce)
                            && !state.settled.contains(&nonce))
                }
                None => false,
            }
        };

        if diverged {
            warn!("⚠️ 외부 트랜잭션 감지 (nonce {}), 재동기화 수행", nonce);
            self.resync(account).await?;
        }
        Ok(diverged)
    }

    pub async fn state(&self, account: Address) -> Option<NonceState> {
        self.accounts.lock().await.get(&account).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockChainClient;
    use std::collections::HashSet;

    fn setup(chain_nonce: u64) -> (Arc<MockChainClient>, Arc<NonceCore>, Address) {
        let chain = Arc::new(MockChainClient::new());
        chain.set_nonce(chain_nonce);
        let core = Arc::new(NonceCore::new(chain.clone()));
        (chain, core, Address::repeat_byte(0xaa))
    }

    #[tokio::test]
    async fn test_concurrent_allocation_is_unique() {
        let (_chain, core, account) = setup(5);

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let core = core.clone();
                tokio::spawn(async move { core.allocate(account).await.unwrap() })
            })
            .collect();

        let mut nonces = HashSet::new();
        for handle in handles {
            assert!(nonces.insert(handle.await.unwrap()));
        }

        assert_eq!(nonces.len(), 100);
        assert_eq!(*nonces.iter().min().unwrap(), 5);
        assert_eq!(*nonces.iter().max().unwrap(), 104);

        let state = core.state(account).await.unwrap();
        assert_eq!(state.next, 105);
        assert!(state.check_invariants());
    }

    #[tokio::test]
    async fn test_release_rewinds_tail_and_reuses_gap() {
        let (_chain, core, account) = setup(0);
        let a = core.allocate(account).await.unwrap();
        let b = core.allocate(account).await.unwrap();
        let c = core.allocate(account).await.unwrap();
        assert_eq!((a, b, c), (0, 1, 2));

        // 중간 값은 gap으로 남았다가 먼저 재사용
        core.release(account, b).await;
        assert_eq!(core.allocate(account).await.unwrap(), 1);

        // 꼬리 값은 next 자체를 되감음
        core.release(account, c).await;
        let state = core.state(account).await.unwrap();
        assert_eq!(state.next, 2);
        assert_eq!(core.allocate(account).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_release_collapses_trailing_gaps() {
        let (_chain, core, account) = setup(10);
        for _ in 0..3 {
            core.allocate(account).await.unwrap();
        }
        core.release(account, 11).await;
        core.release(account, 12).await;

        let state = core.state(account).await.unwrap();
        assert_eq!(state.next, 11);
        assert!(state.released.is_empty());
        assert!(state.check_invariants());
    }

    #[tokio::test]
    async fn test_confirm_advances_only_contiguously() {
        let (_chain, core, account) = setup(0);
        let first = core.allocate(account).await.unwrap();
        let second = core.allocate(account).await.unwrap();

        core.confirm(account, second).await;
        let state = core.state(account).await.unwrap();
        assert_eq!(state.confirmed, 0);
        assert!(state.in_flight.contains(&first));
        assert!(state.check_invariants());

        core.confirm(account, first).await;
        let state = core.state(account).await.unwrap();
        assert_eq!(state.confirmed, 2);
        assert!(state.in_flight.is_empty());
        assert!(state.settled.is_empty());
    }

    #[tokio::test]
    async fn test_resync_drops_settled_in_flight_entries() {
        let (chain, core, account) = setup(0);
        for _ in 0..4 {
            core.allocate(account).await.unwrap();
        }

        // 0, 1이 이미 체인에 포함됨
        chain.set_nonces(2, 4);
        let state = core.resync(account).await.unwrap();

        assert_eq!(state.confirmed, 2);
        assert_eq!(state.in_flight, BTreeSet::from([2, 3]));
        assert_eq!(state.next, 4);
        assert!(state.check_invariants());
    }

    #[tokio::test]
    async fn test_resync_after_external_sends() {
        let (chain, core, account) = setup(3);
        core.initialize(account).await.unwrap();

        chain.set_nonce(7);
        let state = core.resync(account).await.unwrap();
        assert_eq!(state.confirmed, 7);
        assert_eq!(core.allocate(account).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_resync_never_reissues_externally_used_gap() {
        let (chain, core, account) = setup(0);
        for _ in 0..3 {
            core.allocate(account).await.unwrap();
        }
        core.release(account, 1).await;

        // 외부 트랜잭션이 nonce 1을 사용해 pending이 2가 됨
        chain.set_nonces(1, 2);
        core.confirm(account, 0).await;
        let state = core.resync(account).await.unwrap();

        assert!(state.released.is_empty());
        assert_eq!(state.next, 3);
        assert_eq!(core.allocate(account).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_observe_external_triggers_resync() {
        let (chain, core, account) = setup(0);
        core.allocate(account).await.unwrap();

        assert!(!core.observe_external(account, 0).await.unwrap());

        chain.set_nonces(0, 6);
        assert!(core.observe_external(account, 5).await.unwrap());
        assert_eq!(core.state(account).await.unwrap().next, 6);
    }
}
