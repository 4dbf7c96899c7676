use ethers::prelude::abigen;

abigen!(
    OddsLottery,
    r#"[
        event LotteryCreated(uint256 indexed lotteryId, uint256 maxTickets)
        event TicketPurchased(uint256 indexed lotteryId, address indexed buyer, uint256 ticketId)
        event LotteryEnded(uint256 indexed lotteryId, uint256[] winningTicketIds, uint256[] secondPlaceTicketIds, uint256 prizePool, uint256 platformCut, uint256 distributedPool, uint256 totalTicketsSold, uint256 firstPlacePrizePerTicket, uint256 secondPlacePrizePerTicket)
        function TICKET_PRICE() external view returns (uint256)
        function buyTickets(uint256[] lotteryIds, uint256 ticketCount) external
        function createLottery(uint256 lotteryId, uint256 maxTickets) external
        function endLottery(uint256 lotteryId) external
        function getLottery(uint256 lotteryId) external view returns (uint256 id, uint256 maxTickets, uint256 ticketsSold, bool isActive, bool isDrawn, uint256 createdAt)
        function owner() external view returns (address)
        function platformWallet() external view returns (address)
        function usdc() external view returns (address)
    ]"#
);

abigen!(
    Erc20,
    r#"[
        function approve(address spender, uint256 amount) external returns (bool)
        function allowance(address owner, address spender) external view returns (uint256)
        function balanceOf(address account) external view returns (uint256)
    ]"#
);
